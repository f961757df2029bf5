//! デバイスとの制御メッセージプロトコル
//!
//! テキストフレームはJSON（`type` タグ付き）、バイナリフレームは
//! 圧縮音声です。上り `listen` でリスニングモードと明示的な
//! 発話開始/終了を、`abort` で応答の割り込みを通知します。
use serde::{Deserialize, Serialize};

/// クライアント→サーバの制御メッセージ
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "hello")]
    Hello {
        #[serde(default)]
        version: Option<u32>,
        #[serde(default)]
        audio_params: Option<AudioParams>,
    },

    #[serde(rename = "listen")]
    Listen {
        state: String,
        #[serde(default)]
        mode: Option<String>,
    },

    #[serde(rename = "abort")]
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// サーバ→クライアントの制御メッセージ
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "hello")]
    Hello {
        session_id: String,
        transport: String,
        audio_params: AudioParams,
    },

    /// 認識テキストの通知
    #[serde(rename = "stt")]
    Stt { session_id: String, text: String },

    /// LLM応答の文単位テキスト
    #[serde(rename = "llm")]
    Llm { session_id: String, text: String },

    /// 合成音声の再生区間通知
    #[serde(rename = "tts")]
    Tts {
        session_id: String,
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u32,
}

/// listenメッセージのstate値
pub const LISTEN_STATE_START: &str = "start";
pub const LISTEN_STATE_STOP: &str = "stop";

/// ttsメッセージのstate値
pub const TTS_STATE_START: &str = "start";
pub const TTS_STATE_SENTENCE_START: &str = "sentence_start";
pub const TTS_STATE_STOP: &str = "stop";
