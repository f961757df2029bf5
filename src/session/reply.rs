//! 応答パイプライン（LLMストリーム→文分割→TTS→下りフレーム）
//!
//! セッションごとに1つの応答タスクとして起動され、`JoinHandle::abort` で
//! 割り込みキャンセルされます。キャンセル後にフレームが送出されることは
//! ありません。完了/失敗は `ReplyEvent` でセッションループへ通知します。
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::providers::{ChatMessage, ProviderError, ProviderRegistry};

use super::protocol::{ServerMessage, TTS_STATE_SENTENCE_START, TTS_STATE_START, TTS_STATE_STOP};

/// 応答タスクからセッションループへの完了通知
#[derive(Debug)]
pub(super) enum ReplyEvent {
    Finished { assistant_text: String },
    Failed { message: String },
}

pub(super) fn spawn_reply(
    session_id: String,
    registry: Arc<ProviderRegistry>,
    context: Vec<ChatMessage>,
    out_tx: mpsc::Sender<Message>,
    events: mpsc::Sender<ReplyEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let event = match run_reply(&session_id, &registry, context, &out_tx).await {
            Ok(assistant_text) => ReplyEvent::Finished { assistant_text },
            Err(e) => ReplyEvent::Failed {
                message: e.to_string(),
            },
        };
        let _ = events.send(event).await;
    })
}

async fn run_reply(
    session_id: &str,
    registry: &ProviderRegistry,
    context: Vec<ChatMessage>,
    out_tx: &mpsc::Sender<Message>,
) -> Result<String, ProviderError> {
    send_control(
        session_id,
        out_tx,
        ServerMessage::Tts {
            session_id: session_id.to_string(),
            state: TTS_STATE_START.to_string(),
            text: None,
        },
    )
    .await;

    let mut stream = registry.llm.converse(&context);
    let mut assistant_text = String::new();
    let mut pending = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        assistant_text.push_str(&chunk);
        pending.push_str(&chunk);

        while let Some(sentence) = take_sentence(&mut pending) {
            speak_sentence(session_id, registry, out_tx, &sentence).await?;
        }
    }

    // ストリーム終端の残りも1文として合成
    let rest = pending.trim().to_string();
    if !rest.is_empty() {
        speak_sentence(session_id, registry, out_tx, &rest).await?;
    }

    send_control(
        session_id,
        out_tx,
        ServerMessage::Tts {
            session_id: session_id.to_string(),
            state: TTS_STATE_STOP.to_string(),
            text: None,
        },
    )
    .await;

    debug!(session_id = %session_id, chars = assistant_text.chars().count(), "応答完了");
    Ok(assistant_text)
}

/// 1文をTTSへ渡し、合成フレームを下りへ送出
async fn speak_sentence(
    session_id: &str,
    registry: &ProviderRegistry,
    out_tx: &mpsc::Sender<Message>,
    sentence: &str,
) -> Result<(), ProviderError> {
    send_control(
        session_id,
        out_tx,
        ServerMessage::Llm {
            session_id: session_id.to_string(),
            text: sentence.to_string(),
        },
    )
    .await;
    send_control(
        session_id,
        out_tx,
        ServerMessage::Tts {
            session_id: session_id.to_string(),
            state: TTS_STATE_SENTENCE_START.to_string(),
            text: Some(sentence.to_string()),
        },
    )
    .await;

    let frames = registry.tts.synthesize(sentence).await?;
    for frame in frames {
        if out_tx.send(Message::Binary(frame.to_vec())).await.is_err() {
            // 接続が閉じた。以降の送出は不要
            return Ok(());
        }
    }
    Ok(())
}

async fn send_control(_session_id: &str, out_tx: &mpsc::Sender<Message>, message: ServerMessage) {
    if let Ok(json) = serde_json::to_string(&message) {
        let _ = out_tx.send(Message::Text(json)).await;
    }
}

/// バッファ先頭から区切り文字までの1文を取り出す
fn take_sentence(buffer: &mut String) -> Option<String> {
    const DELIMITERS: [char; 7] = ['。', '．', '！', '？', '!', '?', '\n'];

    let (end, delim) = buffer
        .char_indices()
        .find(|(_, c)| DELIMITERS.contains(c))?;
    let sentence: String = buffer[..end + delim.len_utf8()].to_string();
    buffer.drain(..end + delim.len_utf8());

    let trimmed = sentence.trim().to_string();
    if trimmed.is_empty() {
        // 区切りだけの断片は読み捨てて次を探す
        return take_sentence(buffer);
    }
    Some(trimmed)
}
