//! セッション（接続ごとの状態機械とオーケストレーション）
//!
//! 1本のWebSocket接続＝1セッション。上りの圧縮フレームをデコードし、
//! VADフラグを付けてセグメンタへ流し、確定した発話をディスパッチャ経由で
//! 認識へ回します。認識テキストはLLM→TTSの応答パイプラインに接続され、
//! 割り込み（abortメッセージまたは応答中の新たな音声）で中断できます。
//!
//! 状態遷移:
//! `IdleListening → VoiceActive → AwaitingRecognition → Replying → IdleListening`
//! 応答中の割り込みは `Interrupted` を経て `IdleListening` へ戻ります。
//! 切断/シャットダウンで `Closed`（以後フレームは受け付けない）。
pub mod protocol;
mod reply;

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{CodecError, OpusFrameDecoder};
use crate::config::ConfigSet;
use crate::dispatcher::{DispatchError, RecognitionDispatcher, RecognitionJob};
use crate::providers::{ChatMessage, ProviderRegistry};
use crate::report::{ReportHandle, UtteranceReport};
use crate::segmenter::{AudioFrame, ListenMode, SegmentOutcome, UtteranceSegmenter};
use crate::vad::{EnergyVad, VoiceActivityDetector};

use protocol::{
    AudioParams, ClientMessage, ServerMessage, LISTEN_STATE_START, LISTEN_STATE_STOP,
    TTS_STATE_STOP,
};
use reply::ReplyEvent;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// セッション状態機械の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    IdleListening,
    VoiceActive,
    AwaitingRecognition,
    Replying,
    Interrupted,
    Closed,
}

/// WebSocket接続1本分のセッションを実行
///
/// 接続マネージャから呼ばれ、切断またはシャットダウン通知まで戻りません。
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    config: Arc<ConfigSet>,
    registry: Arc<ProviderRegistry>,
    report: ReportHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let session_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = ws.split();

    // 下り送信タスク（サーバ→クライアント）
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(128);
    let send_session_id = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                debug!(session_id = %send_session_id, "WebSocket送信失敗、送信タスク終了");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // シャットダウン時のクローズ通知用に送信口を残しておく
    let close_tx = out_tx.clone();

    // ディスパッチャワーカーからの認識ジョブ受け口（容量1で直列）
    let (job_tx, mut job_rx) = mpsc::channel::<RecognitionJob>(1);
    let (reply_event_tx, mut reply_event_rx) = mpsc::channel::<ReplyEvent>(8);

    let mut session =
        match Session::new(session_id.clone(), config, registry, report, out_tx, job_tx, reply_event_tx) {
            Ok(s) => s,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "セッション初期化に失敗");
                send_task.abort();
                return;
            }
        };

    info!(session_id = %session_id, "session started");

    loop {
        tokio::select! {
            maybe_msg = ws_rx.next() => {
                match maybe_msg {
                    Some(Ok(msg)) => {
                        if !session.handle_message(msg).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "WebSocketエラー");
                        break;
                    }
                    None => break,
                }
            }
            Some(job) = job_rx.recv() => {
                session.handle_recognition_job(job).await;
            }
            Some(event) = reply_event_rx.recv() => {
                session.handle_reply_event(event);
            }
            _ = shutdown_rx.changed() => {
                info!(session_id = %session_id, "シャットダウン通知を受信");
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                }));
                let _ = close_tx.send(close).await;
                break;
            }
        }
    }

    session.close().await;
    drop(session);
    drop(close_tx);
    let _ = send_task.await;
    info!(session_id = %session_id, "session closed");
}

struct Session {
    id: String,
    state: SessionState,
    config: Arc<ConfigSet>,
    registry: Arc<ProviderRegistry>,
    report: ReportHandle,
    decoder: OpusFrameDecoder,
    vad: EnergyVad,
    segmenter: UtteranceSegmenter,
    dispatcher: Option<RecognitionDispatcher>,
    out_tx: mpsc::Sender<Message>,
    reply_event_tx: mpsc::Sender<ReplyEvent>,
    reply: Option<JoinHandle<()>>,
    history: Vec<ChatMessage>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: String,
        config: Arc<ConfigSet>,
        registry: Arc<ProviderRegistry>,
        report: ReportHandle,
        out_tx: mpsc::Sender<Message>,
        job_tx: mpsc::Sender<RecognitionJob>,
        reply_event_tx: mpsc::Sender<ReplyEvent>,
    ) -> Result<Self, SessionError> {
        let audio = &config.audio;
        let decoder = OpusFrameDecoder::new(
            audio.input.sample_rate_hz,
            audio.input.channels,
            audio.frame_samples(),
        )?;
        let vad = EnergyVad::new(&audio.vad);
        let segmenter =
            UtteranceSegmenter::new(id.clone(), audio.segmenter.clone(), ListenMode::Auto);
        let dispatcher = RecognitionDispatcher::start(id.clone(), job_tx)?;

        Ok(Self {
            id,
            state: SessionState::IdleListening,
            config,
            registry,
            report,
            decoder,
            vad,
            segmenter,
            dispatcher: Some(dispatcher),
            out_tx,
            reply_event_tx,
            reply: None,
            history: Vec::new(),
        })
    }

    /// 受信メッセージを1つ処理。falseで接続終了
    async fn handle_message(&mut self, message: Message) -> bool {
        match message {
            Message::Binary(data) => {
                self.on_audio_frame(data).await;
                true
            }
            Message::Text(text) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => self.on_control_message(msg).await,
                    Err(e) => {
                        warn!(session_id = %self.id, error = %e, "制御メッセージの解析に失敗");
                        self.send(ServerMessage::Error {
                            message: format!("invalid control message: {e}"),
                        })
                        .await;
                    }
                }
                true
            }
            Message::Close(_) => {
                info!(session_id = %self.id, "WebSocket切断");
                false
            }
            _ => true,
        }
    }

    /// 上り音声フレーム1つの処理。イベントループをブロックしない
    async fn on_audio_frame(&mut self, data: Vec<u8>) {
        if self.state == SessionState::Closed {
            return;
        }

        let pcm = match self.decoder.decode(&Bytes::from(data)) {
            Ok(pcm) => pcm,
            Err(e) => {
                // 1フレームの破損は発話を中断させない
                warn!(session_id = %self.id, error = %e, "フレームのデコードに失敗、スキップ");
                return;
            }
        };

        let have_voice = self.vad.detect(&pcm);

        // 応答再生中に新たな音声を検出したら割り込み
        if have_voice && self.state == SessionState::Replying {
            self.interrupt_reply("voice activity during reply").await;
        }
        if have_voice && self.state == SessionState::IdleListening {
            self.state = SessionState::VoiceActive;
        }

        let outcome = self.segmenter.observe(AudioFrame { pcm, have_voice });
        self.apply_segment_outcome(outcome);
    }

    async fn on_control_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Hello { .. } => {
                debug!(session_id = %self.id, "client hello");
                self.send_hello().await;
            }
            ClientMessage::Listen { state, mode } => {
                if let Some(mode) = mode {
                    match mode.parse::<ListenMode>() {
                        Ok(mode) => self.segmenter.set_mode(mode),
                        Err(e) => warn!(session_id = %self.id, error = %e, "不明なリスニングモード"),
                    }
                }
                match state.as_str() {
                    LISTEN_STATE_START => {
                        if self.segmenter.mode() == ListenMode::Manual {
                            self.segmenter.signal_voice_start();
                            if self.state == SessionState::IdleListening {
                                self.state = SessionState::VoiceActive;
                            }
                        }
                    }
                    LISTEN_STATE_STOP => {
                        // 明示的な発話終了（manualモードの唯一の終了トリガ）
                        let outcome = self.segmenter.finalize();
                        self.apply_segment_outcome(outcome);
                    }
                    other => {
                        debug!(session_id = %self.id, state = %other, "未対応のlisten state");
                    }
                }
            }
            ClientMessage::Abort { reason } => {
                let reason = reason.unwrap_or_else(|| "client abort".to_string());
                self.interrupt_reply(&reason).await;
            }
        }
    }

    fn apply_segment_outcome(&mut self, outcome: SegmentOutcome) {
        match outcome {
            SegmentOutcome::Continue => {}
            SegmentOutcome::Discard => {
                self.vad.reset();
                if self.state == SessionState::VoiceActive {
                    self.state = SessionState::IdleListening;
                }
            }
            SegmentOutcome::Ready(task) => {
                self.vad.reset();
                self.state = SessionState::AwaitingRecognition;
                let enqueued = self
                    .dispatcher
                    .as_ref()
                    .map(|d| d.enqueue(task))
                    .unwrap_or(Err(DispatchError::QueueClosed));
                if let Err(e) = enqueued {
                    warn!(session_id = %self.id, error = %e, "認識タスクの投入に失敗");
                    self.state = SessionState::IdleListening;
                }
            }
        }
    }

    /// ディスパッチャワーカーから渡された認識ジョブをループ側で実行
    ///
    /// 結果スロットへの応答がワーカーの「次タスク取り出し」を解放するため、
    /// 応答パイプラインの起動後・完了前に返答します（認識の直列性は保たれ、
    /// 応答の再生はワーカーをブロックしません）。
    async fn handle_recognition_job(&mut self, job: RecognitionJob) {
        let RecognitionJob { task, result_tx } = job;
        self.state = SessionState::AwaitingRecognition;

        let frame_count = task.frames.len();
        match self
            .registry
            .asr
            .recognize(&task.frames, task.format, &self.id)
            .await
        {
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "音声認識に失敗、発話を破棄");
                let _ = result_tx.send(Err(e.to_string()));
                self.state = SessionState::IdleListening;
            }
            Ok((text, artifact)) => {
                let _ = result_tx.send(Ok(()));
                if let Some(path) = artifact {
                    debug!(session_id = %self.id, path = ?path, "音声アーティファクトを保存");
                }
                let text = text.trim().to_string();
                if text.is_empty() {
                    self.state = SessionState::IdleListening;
                    return;
                }

                info!(
                    session_id = %self.id,
                    text = %text,
                    format = task.format.as_str(),
                    "認識テキスト"
                );
                self.report.enqueue(UtteranceReport {
                    session_id: self.id.clone(),
                    text: text.clone(),
                    frame_count,
                });
                self.send(ServerMessage::Stt {
                    session_id: self.id.clone(),
                    text: text.clone(),
                })
                .await;
                self.start_reply(text).await;
            }
        }
    }

    /// 対話→合成→送出の応答パイプラインを開始
    async fn start_reply(&mut self, user_text: String) {
        // 直前の応答のキャンセルが完了してから次の対話を開始する
        self.settle_reply().await;

        self.history.push(ChatMessage::user(user_text));
        self.state = SessionState::Replying;
        let handle = reply::spawn_reply(
            self.id.clone(),
            self.registry.clone(),
            self.history.clone(),
            self.out_tx.clone(),
            self.reply_event_tx.clone(),
        );
        self.reply = Some(handle);
    }

    /// 進行中の応答を中断する
    ///
    /// 応答タスクは状態にかかわらず必ず停止させます。次の発話が確定して
    /// 状態が先へ進んだあとでも、古い応答のフレームを流し続けません。
    async fn interrupt_reply(&mut self, reason: &str) {
        if self.state != SessionState::Replying && self.reply.is_none() {
            return;
        }
        info!(session_id = %self.id, reason = %reason, "応答を割り込みで中断");
        if self.state == SessionState::Replying {
            self.state = SessionState::Interrupted;
        }
        self.settle_reply().await;
        self.send(ServerMessage::Tts {
            session_id: self.id.clone(),
            state: TTS_STATE_STOP.to_string(),
            text: None,
        })
        .await;
        if self.state == SessionState::Interrupted {
            self.state = SessionState::IdleListening;
        }
    }

    /// 応答タスクを停止し、完了（キャンセル含む）まで待つ
    async fn settle_reply(&mut self) {
        if let Some(handle) = self.reply.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    fn handle_reply_event(&mut self, event: ReplyEvent) {
        match event {
            ReplyEvent::Finished { assistant_text } => {
                if !assistant_text.is_empty() {
                    self.history.push(ChatMessage::assistant(assistant_text));
                }
                if self.state == SessionState::Replying {
                    self.state = SessionState::IdleListening;
                }
                self.reply = None;
            }
            ReplyEvent::Failed { message } => {
                warn!(session_id = %self.id, error = %message, "応答パイプラインに失敗、待機へ復帰");
                if self.state == SessionState::Replying {
                    self.state = SessionState::IdleListening;
                }
                self.reply = None;
            }
        }
    }

    async fn send_hello(&self) {
        let audio = &self.config.audio;
        self.send(ServerMessage::Hello {
            session_id: self.id.clone(),
            transport: "websocket".to_string(),
            audio_params: AudioParams {
                format: "opus".to_string(),
                sample_rate: audio.input.sample_rate_hz,
                channels: audio.input.channels,
                frame_duration: audio.input.frame_duration_ms,
            },
        })
        .await;
    }

    async fn send(&self, message: ServerMessage) {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "メッセージのシリアライズに失敗");
                return;
            }
        };
        let _ = self.out_tx.send(Message::Text(json)).await;
    }

    /// セッションを閉じる。以後フレームは受け付けない
    async fn close(&mut self) {
        self.state = SessionState::Closed;
        self.settle_reply().await;
        if let Some(dispatcher) = self.dispatcher.take() {
            let drained = dispatcher.shutdown(self.config.server.drain_timeout()).await;
            if !drained {
                // ドレインタイムアウトは報告のみ。リソースは強制解放
                warn!(session_id = %self.id, "ディスパッチャのドレインがタイムアウト");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::spawn_sink;

    fn load_test_config(dir: &std::path::Path) -> Arc<ConfigSet> {
        std::fs::write(
            dir.join("server.yaml"),
            "ws_bind_addr: \"127.0.0.1:0\"\nauth:\n  enabled: false\n",
        )
        .expect("write server.yaml");
        std::fs::write(
            dir.join("audio.yaml"),
            r#"
input:
  sample_rate_hz: 16000
  channels: 1
  frame_duration_ms: 60
vad:
  energy_threshold: 500.0
  hangover_frames: 3
segmenter: {}
"#,
        )
        .expect("write audio.yaml");
        // チャンク間隔を極端に長くし、応答ストリームが進まないようにする
        std::fs::write(
            dir.join("providers.yaml"),
            r#"
selected:
  asr: mock
  tts: mock
  llm: mock
llm:
  mock:
    reply: "とても長い応答が続きます。"
    chunk_delay_ms: "60000"
"#,
        )
        .expect("write providers.yaml");
        Arc::new(ConfigSet::load_from_dir(dir).expect("load config"))
    }

    fn json_of(message: Message) -> serde_json::Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).expect("json"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_settles_stale_reply_after_new_utterance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_test_config(dir.path());
        let registry =
            Arc::new(ProviderRegistry::from_config(&config.providers).expect("registry"));
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(128);
        let (job_tx, _job_rx) = mpsc::channel::<RecognitionJob>(1);
        let (reply_event_tx, _reply_event_rx) = mpsc::channel::<ReplyEvent>(8);

        let mut session = Session::new(
            "s1".to_string(),
            config,
            registry,
            spawn_sink(),
            out_tx,
            job_tx,
            reply_event_tx,
        )
        .expect("session");

        session.start_reply("電気をつけて".to_string()).await;
        assert_eq!(session.state, SessionState::Replying);
        let start = json_of(out_rx.recv().await.expect("message"));
        assert_eq!(start["state"], "start");

        // 次の発話が確定して状態が先へ進んだあとにabortが届くケース
        session.state = SessionState::AwaitingRecognition;
        session.interrupt_reply("client abort").await;

        assert!(session.reply.is_none(), "stale reply must be settled");
        assert_eq!(session.state, SessionState::AwaitingRecognition);

        // 下りにはttsのstopだけが流れ、古い応答の音声は出ない
        let stop = json_of(out_rx.recv().await.expect("message"));
        assert_eq!(stop["type"], "tts");
        assert_eq!(stop["state"], "stop");
        assert!(out_rx.try_recv().is_err());

        session.close().await;
    }
}
