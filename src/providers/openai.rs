//! OpenAI互換APIプロバイダ
//!
//! `api_key` は必須（欠落は起動時致命エラー）。`base_url` を差し替えれば
//! 互換エンドポイントにも接続できます。未知のオプションキーは無視します。
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::{Capability, ConfigError, ProviderOptions};
use crate::segmenter::{AudioFormat, AudioFrame};

use super::error::ProviderError;
use super::{AsrProvider, ChatMessage, ChatStream, LlmProvider, TtsProvider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

fn base_url(options: &ProviderOptions) -> String {
    options
        .get_str("base_url")
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
        .trim_end_matches('/')
        .to_string()
}

/// `/audio/transcriptions` を用いる音声認識
pub struct OpenAiAsrProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    language_code: Option<String>,
    output_dir: Option<PathBuf>,
}

impl OpenAiAsrProvider {
    pub fn from_options(name: &str, options: &ProviderOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url(options),
            api_key: options.require_str(Capability::Asr, name, "api_key")?,
            model: options
                .get_str("model")
                .unwrap_or_else(|| "whisper-1".to_string()),
            language_code: options.get_str("language_code"),
            output_dir: options.get_str("output_dir").map(PathBuf::from),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl AsrProvider for OpenAiAsrProvider {
    async fn recognize(
        &self,
        frames: &[AudioFrame],
        _format: AudioFormat,
        session_id: &str,
    ) -> Result<(String, Option<PathBuf>), ProviderError> {
        let pcm: Vec<i16> = frames.iter().flat_map(|f| f.pcm.iter().copied()).collect();
        // 空音声は契約どおり空テキスト（呼び出し自体を失敗させない）
        if pcm.is_empty() {
            return Ok((String::new(), None));
        }

        let wav = super::wav_bytes(&pcm, 16000);
        let artifact = match &self.output_dir {
            Some(dir) => Some(super::write_wav_artifact(dir, session_id, &pcm, 16000)?),
            None => None,
        };

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(lang) = &self.language_code {
            form = form.text("language", lang.clone());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: TranscriptionResponse = response.json().await?;
        debug!(session_id = %session_id, "transcription received");
        Ok((body.text.trim().to_string(), artifact))
    }
}

/// `/audio/speech` を用いる音声合成
pub struct OpenAiTtsProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    format: String,
}

impl OpenAiTtsProvider {
    pub fn from_options(name: &str, options: &ProviderOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url(options),
            api_key: options.require_str(Capability::Tts, name, "api_key")?,
            model: options
                .get_str("model")
                .unwrap_or_else(|| "tts-1".to_string()),
            voice: options
                .get_str("voice")
                .unwrap_or_else(|| "alloy".to_string()),
            format: options
                .get_str("format")
                .unwrap_or_else(|| "opus".to_string()),
        })
    }
}

#[async_trait]
impl TtsProvider for OpenAiTtsProvider {
    async fn synthesize(&self, text: &str) -> Result<Vec<Bytes>, ProviderError> {
        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "voice": self.voice,
                "input": text,
                "response_format": self.format,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let payload = response.bytes().await?;
        Ok(vec![payload])
    }
}

/// `/chat/completions` のSSEストリーミングを用いる対話生成
#[derive(Debug)]
pub struct OpenAiLlmProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiLlmProvider {
    pub fn from_options(name: &str, options: &ProviderOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url(options),
            api_key: options.require_str(Capability::Llm, name, "api_key")?,
            model: options
                .get_str("model")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// SSEの1行からコンテンツ差分を取り出す
fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)?;
            if content.is_empty() {
                None
            } else {
                Some(SseEvent::Content(content))
            }
        }
        Err(e) => {
            warn!(error = %e, "SSEチャンクの解析に失敗、行をスキップ");
            None
        }
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Content(String),
    Done,
}

impl LlmProvider for OpenAiLlmProvider {
    fn converse(&self, context: &[ChatMessage]) -> ChatStream {
        let (tx, rx) = mpsc::channel::<Result<String, ProviderError>>(16);
        let client = self.client.clone();
        let url = format!("{}/chat/completions", self.base_url);
        let api_key = self.api_key.clone();
        let payload = json!({
            "model": self.model,
            "messages": context,
            "stream": true,
        });

        tokio::spawn(async move {
            let response = match client
                .post(url)
                .bearer_auth(api_key)
                .json(&payload)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                let _ = tx
                    .send(Err(ProviderError::Api {
                        status: status.as_u16(),
                        message,
                    }))
                    .await;
                return;
            }

            let mut body = response.bytes_stream();
            let mut line_buf = String::new();
            while let Some(piece) = body.next().await {
                let piece = match piece {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                line_buf.push_str(&String::from_utf8_lossy(&piece));

                while let Some(pos) = line_buf.find('\n') {
                    let line = line_buf[..pos].trim_end_matches('\r').to_string();
                    line_buf.drain(..=pos);
                    match parse_sse_line(&line) {
                        Some(SseEvent::Done) => return,
                        Some(SseEvent::Content(content)) => {
                            if tx.send(Ok(content)).await.is_err() {
                                // 受信側破棄＝応答キャンセル、転送を中断
                                return;
                            }
                        }
                        None => {}
                    }
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_content_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"こんに"}}]}"#;
        assert_eq!(
            parse_sse_line(line),
            Some(SseEvent::Content("こんに".to_string()))
        );
    }

    #[test]
    fn test_parse_sse_done_marker() {
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseEvent::Done));
    }

    #[test]
    fn test_parse_sse_ignores_non_data_lines() {
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line(""), None);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{}}]}"#),
            None
        );
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let err = OpenAiLlmProvider::from_options("openai", &ProviderOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingProviderOption { .. }));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let options =
            ProviderOptions::from_pairs(&[("api_key", "k"), ("base_url", "http://localhost:1234/")]);
        let provider = OpenAiLlmProvider::from_options("openai", &options).expect("provider");
        assert_eq!(provider.base_url, "http://localhost:1234");
    }
}
