//! 発話セグメンタ
//!
//! デコード済みPCMフレームと音声フラグを受け取り、発話の開始/終了を
//! 判定します。バッファは無音継続中プリロール分（既定10フレーム）に
//! 刈り込み、発話終了時に最小フレーム数（既定15）を超えていれば
//! `RecognitionTask` として切り出します。
//!
//! 終了判定はリスニングモードに依存します:
//! - `auto` / `realtime`: 音声フラグから導出（連続無音で終了）
//! - `manual`: クライアントの明示的な stop 制御メッセージのみ
use std::str::FromStr;

use tracing::debug;

use crate::config::SegmenterConfig;

/// デコード済みPCMチャンク＋音声フラグ
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pcm: Vec<i16>,
    pub have_voice: bool,
}

/// 認識対象音声のフォーマットタグ（上りはデコード後に渡すため常にPCM）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Pcm,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Pcm => "pcm",
        }
    }
}

/// 1発話分の不変スナップショット。ディスパッチャがちょうど1回消費する
#[derive(Debug)]
pub struct RecognitionTask {
    pub session_id: String,
    pub frames: Vec<AudioFrame>,
    pub format: AudioFormat,
}

/// セッションごとのリスニングモード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenMode {
    #[default]
    Auto,
    Manual,
    Realtime,
}

impl FromStr for ListenMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ListenMode::Auto),
            "manual" => Ok(ListenMode::Manual),
            "realtime" => Ok(ListenMode::Realtime),
            other => Err(format!("unknown listen mode: {other}")),
        }
    }
}

/// `observe` / `finalize` の判定結果
#[derive(Debug)]
pub enum SegmentOutcome {
    /// 発話継続中（またはアイドル）
    Continue,
    /// 発話終了したが短すぎるため破棄
    Discard,
    /// 発話が1つ確定
    Ready(RecognitionTask),
}

pub struct UtteranceSegmenter {
    session_id: String,
    config: SegmenterConfig,
    mode: ListenMode,
    buffer: Vec<AudioFrame>,
    /// この発話内で一度でも音声を観測したか
    client_have_voice: bool,
    /// 音声観測後の連続無音フレーム数
    silent_run: usize,
}

impl UtteranceSegmenter {
    pub fn new(session_id: impl Into<String>, config: SegmenterConfig, mode: ListenMode) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            mode,
            buffer: Vec::new(),
            client_have_voice: false,
            silent_run: 0,
        }
    }

    pub fn mode(&self) -> ListenMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ListenMode) {
        self.mode = mode;
    }

    /// manualモードでクライアントが発話開始を通知したとき呼ぶ
    pub fn signal_voice_start(&mut self) {
        self.client_have_voice = true;
        self.silent_run = 0;
    }

    #[cfg(test)]
    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    /// フレームを1つ観測し、発話状態を更新
    pub fn observe(&mut self, frame: AudioFrame) -> SegmentOutcome {
        // manualモードでは音声有無をクライアント通知に従う
        let have_voice = match self.mode {
            ListenMode::Auto | ListenMode::Realtime => frame.have_voice,
            ListenMode::Manual => self.client_have_voice,
        };

        self.buffer.push(frame);

        // 現フレームにも直近にも音声が無ければプリロール分だけ残す
        if !have_voice && !self.client_have_voice {
            let pre_roll = self.config.pre_roll_frames;
            if self.buffer.len() > pre_roll {
                self.buffer.drain(..self.buffer.len() - pre_roll);
            }
            return SegmentOutcome::Continue;
        }

        if have_voice {
            self.client_have_voice = true;
            self.silent_run = 0;
        } else {
            self.silent_run += 1;
        }

        // auto/realtimeでは連続無音から発話終了を導出
        let derived_stop = matches!(self.mode, ListenMode::Auto | ListenMode::Realtime)
            && self.silent_run >= self.config.silence_stop_frames;
        if derived_stop {
            return self.finalize();
        }

        SegmentOutcome::Continue
    }

    /// 発話終了を確定（明示stopまたは無音導出から呼ばれる）
    ///
    /// 短すぎる発話でもバッファとVAD状態は無条件にリセットします。
    /// 後段の認識が失敗しても次の発話はクリーンな状態から始まります。
    pub fn finalize(&mut self) -> SegmentOutcome {
        let frames = std::mem::take(&mut self.buffer);
        self.reset_voice_state();

        if frames.len() > self.config.min_utterance_frames {
            debug!(
                session_id = %self.session_id,
                frames = frames.len(),
                "発話を確定、認識タスクを生成"
            );
            SegmentOutcome::Ready(RecognitionTask {
                session_id: self.session_id.clone(),
                frames,
                format: AudioFormat::Pcm,
            })
        } else {
            debug!(
                session_id = %self.session_id,
                frames = frames.len(),
                "発話が短すぎるため破棄"
            );
            SegmentOutcome::Discard
        }
    }

    /// バッファと音声状態を完全にリセット
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.reset_voice_state();
    }

    fn reset_voice_state(&mut self) {
        self.client_have_voice = false;
        self.silent_run = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SegmenterConfig {
        SegmenterConfig {
            pre_roll_frames: 10,
            min_utterance_frames: 15,
            silence_stop_frames: 8,
        }
    }

    fn frame(have_voice: bool) -> AudioFrame {
        AudioFrame {
            pcm: vec![0_i16; 960],
            have_voice,
        }
    }

    #[test]
    fn test_silence_buffer_never_exceeds_pre_roll() {
        let mut seg = UtteranceSegmenter::new("s1", config(), ListenMode::Auto);
        for _ in 0..50 {
            match seg.observe(frame(false)) {
                SegmentOutcome::Continue => {}
                other => panic!("unexpected outcome: {other:?}"),
            }
            assert!(seg.buffered_frames() <= 10);
        }
    }

    #[test]
    fn test_long_utterance_becomes_ready() {
        let mut seg = UtteranceSegmenter::new("s1", config(), ListenMode::Auto);
        for _ in 0..20 {
            assert!(matches!(seg.observe(frame(true)), SegmentOutcome::Continue));
        }
        // 連続無音で発話終了が導出される
        let mut outcome = SegmentOutcome::Continue;
        for _ in 0..8 {
            outcome = seg.observe(frame(false));
        }
        match outcome {
            SegmentOutcome::Ready(task) => {
                // 最後のリセット以降の全フレーム（音声20 + 無音8）
                assert_eq!(task.frames.len(), 28);
                assert_eq!(task.format, AudioFormat::Pcm);
            }
            other => panic!("expected ready, got {other:?}"),
        }
        assert_eq!(seg.buffered_frames(), 0);
    }

    #[test]
    fn test_exactly_one_ready_per_utterance() {
        let mut seg = UtteranceSegmenter::new("s1", config(), ListenMode::Auto);
        let mut ready_count = 0;
        for _ in 0..20 {
            seg.observe(frame(true));
        }
        for _ in 0..30 {
            if matches!(seg.observe(frame(false)), SegmentOutcome::Ready(_)) {
                ready_count += 1;
            }
        }
        assert_eq!(ready_count, 1);
    }

    #[test]
    fn test_short_utterance_is_discarded() {
        let mut seg = UtteranceSegmenter::new("s1", config(), ListenMode::Auto);
        for _ in 0..5 {
            assert!(matches!(seg.observe(frame(true)), SegmentOutcome::Continue));
        }
        // 5音声 + 8無音 = 13フレーム ≤ 15 → 破棄
        let mut outcome = SegmentOutcome::Continue;
        for _ in 0..8 {
            outcome = seg.observe(frame(false));
        }
        assert!(matches!(outcome, SegmentOutcome::Discard));
        assert_eq!(seg.buffered_frames(), 0);
    }

    #[test]
    fn test_discard_resets_voice_state() {
        let mut seg = UtteranceSegmenter::new("s1", config(), ListenMode::Auto);
        for _ in 0..5 {
            seg.observe(frame(true));
        }
        for _ in 0..8 {
            seg.observe(frame(false));
        }
        // 破棄後の無音はアイドル扱いとなり、プリロール刈り込みに戻る
        for _ in 0..20 {
            assert!(matches!(seg.observe(frame(false)), SegmentOutcome::Continue));
        }
        assert!(seg.buffered_frames() <= 10);
    }

    #[test]
    fn test_manual_mode_ignores_silence_and_waits_for_explicit_stop() {
        let mut seg = UtteranceSegmenter::new("s1", config(), ListenMode::Manual);
        seg.signal_voice_start();

        // フレーム1〜12: 音声あり、13〜20: 無音
        for _ in 0..12 {
            assert!(matches!(seg.observe(frame(true)), SegmentOutcome::Continue));
        }
        for _ in 0..8 {
            // manualでは無音からの自動終了は発火しない
            assert!(matches!(seg.observe(frame(false)), SegmentOutcome::Continue));
        }
        assert_eq!(seg.buffered_frames(), 20);

        // 明示的なstopで全20フレームが確定
        match seg.finalize() {
            SegmentOutcome::Ready(task) => assert_eq!(task.frames.len(), 20),
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_pre_roll_is_retained_before_voice() {
        let mut seg = UtteranceSegmenter::new("s1", config(), ListenMode::Auto);
        // 長い無音ののち発話開始
        for _ in 0..30 {
            seg.observe(frame(false));
        }
        for _ in 0..16 {
            seg.observe(frame(true));
        }
        match seg.finalize() {
            SegmentOutcome::Ready(task) => {
                // プリロール10 + 音声16
                assert_eq!(task.frames.len(), 26);
                assert!(!task.frames[0].have_voice, "pre-roll should lead");
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_listen_mode_parsing() {
        assert_eq!("auto".parse::<ListenMode>(), Ok(ListenMode::Auto));
        assert_eq!("manual".parse::<ListenMode>(), Ok(ListenMode::Manual));
        assert_eq!("realtime".parse::<ListenMode>(), Ok(ListenMode::Realtime));
        assert!("wake".parse::<ListenMode>().is_err());
    }
}
