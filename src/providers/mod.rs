//! プロバイダ契約とレジストリ
//!
//! ASR（音声認識）/ TTS（音声合成）/ LLM（対話生成）の3ケイパビリティを
//! トレイトで定義し、設定の実装名からインスタンスを構築します。
//! レジストリは起動時に1度だけ構築され、以後は全セッションから
//! 読み取り専用で共有されます（構築後の変更は不可）。
mod error;
mod mock;
mod openai;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{Capability, ConfigError, ProvidersConfig};
use crate::segmenter::{AudioFormat, AudioFrame};

pub use error::ProviderError;
pub use mock::{MockAsrProvider, MockLlmProvider, MockTtsProvider};
pub use openai::{OpenAiAsrProvider, OpenAiLlmProvider, OpenAiTtsProvider};

/// 対話コンテキストの1メッセージ
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// LLM応答のチャンクストリーム
///
/// 有限で1回だけ消費されます。受信側を破棄すれば生成側は
/// 送信失敗を観測して中断します（応答キャンセル）。
pub type ChatStream = ReceiverStream<Result<String, ProviderError>>;

/// 音声認識プロバイダ契約
///
/// 空または判別不能な音声は失敗ではなく空文字列を返します。
/// 通信・認証エラーは回復可能な `ProviderError` として返します。
#[async_trait]
pub trait AsrProvider: Send + Sync {
    /// 1発話分のフレームをテキストへ変換
    ///
    /// 戻り値は（認識テキスト, 保存した音声アーティファクトのパス）。
    async fn recognize(
        &self,
        frames: &[AudioFrame],
        format: AudioFormat,
        session_id: &str,
    ) -> Result<(String, Option<PathBuf>), ProviderError>;
}

/// 音声合成プロバイダ契約
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// テキストを下りフレーム列（バイナリ送出単位）へ合成
    async fn synthesize(&self, text: &str) -> Result<Vec<Bytes>, ProviderError>;
}

/// 対話生成プロバイダ契約
pub trait LlmProvider: Send + Sync {
    /// コンテキストから応答チャンクの遅延ストリームを開始
    fn converse(&self, context: &[ChatMessage]) -> ChatStream;
}

/// 設定から構築される読み取り専用レジストリ
pub struct ProviderRegistry {
    pub asr: Arc<dyn AsrProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub llm: Arc<dyn LlmProvider>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry").finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// 選択された実装名からレジストリを構築
    ///
    /// 未知の実装名・必須オプション欠落は起動時致命エラー。
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, ConfigError> {
        let asr_name = config.selected.asr.as_str();
        let asr: Arc<dyn AsrProvider> = match asr_name {
            "mock" => Arc::new(MockAsrProvider::new(
                config.options_for(Capability::Asr, asr_name),
            )),
            "openai" => Arc::new(OpenAiAsrProvider::from_options(
                asr_name,
                &config.options_for(Capability::Asr, asr_name),
            )?),
            other => {
                return Err(ConfigError::UnknownProvider {
                    capability: Capability::Asr.to_string(),
                    name: other.to_string(),
                })
            }
        };

        let tts_name = config.selected.tts.as_str();
        let tts: Arc<dyn TtsProvider> = match tts_name {
            "mock" => {
                let provider = MockTtsProvider::new(config.options_for(Capability::Tts, tts_name))
                    .map_err(|e| ConfigError::ProviderInit {
                        capability: Capability::Tts.to_string(),
                        name: tts_name.to_string(),
                        message: e.to_string(),
                    })?;
                Arc::new(provider)
            }
            "openai" => Arc::new(OpenAiTtsProvider::from_options(
                tts_name,
                &config.options_for(Capability::Tts, tts_name),
            )?),
            other => {
                return Err(ConfigError::UnknownProvider {
                    capability: Capability::Tts.to_string(),
                    name: other.to_string(),
                })
            }
        };

        let llm_name = config.selected.llm.as_str();
        let llm: Arc<dyn LlmProvider> = match llm_name {
            "mock" => Arc::new(MockLlmProvider::new(
                config.options_for(Capability::Llm, llm_name),
            )),
            "openai" => Arc::new(OpenAiLlmProvider::from_options(
                llm_name,
                &config.options_for(Capability::Llm, llm_name),
            )?),
            other => {
                return Err(ConfigError::UnknownProvider {
                    capability: Capability::Llm.to_string(),
                    name: other.to_string(),
                })
            }
        };

        Ok(Self { asr, tts, llm })
    }
}

/// PCM（モノラル/16kHz/16bit）をWAVとして書き出し
///
/// `output_dir` 指定時のASRアーティファクト保存に使用します。
pub(crate) fn write_wav_artifact(
    output_dir: &std::path::Path,
    session_id: &str,
    pcm: &[i16],
    sample_rate: u32,
) -> std::io::Result<PathBuf> {
    let file_name = format!("asr_{}_{}.wav", session_id, uuid::Uuid::new_v4());
    let path = output_dir.join(file_name);
    std::fs::create_dir_all(output_dir)?;
    std::fs::write(&path, wav_bytes(pcm, sample_rate))?;
    Ok(path)
}

/// PCMサンプル列からWAVバイト列を構築（16bit/モノラル）
pub(crate) fn wav_bytes(pcm: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (pcm.len() * 2) as u32;
    let byte_rate = sample_rate * 2;
    let mut out = Vec::with_capacity(44 + pcm.len() * 2);

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16_u32.to_le_bytes());
    out.extend_from_slice(&1_u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1_u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2_u16.to_le_bytes()); // block align
    out.extend_from_slice(&16_u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in pcm {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvidersConfig;

    fn providers_yaml(asr: &str, tts: &str, llm: &str) -> ProvidersConfig {
        let yaml = format!(
            r#"
selected:
  asr: {asr}
  tts: {tts}
  llm: {llm}
llm:
  mock:
    reply: "テスト応答です。"
"#
        );
        serde_yaml::from_str(&yaml).expect("parse")
    }

    #[test]
    fn test_registry_builds_mock_set() {
        let cfg = providers_yaml("mock", "mock", "mock");
        assert!(ProviderRegistry::from_config(&cfg).is_ok());
    }

    #[test]
    fn test_unknown_provider_is_fatal() {
        let cfg = providers_yaml("mock", "nonexistent", "mock");
        let err = ProviderRegistry::from_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider { .. }));
    }

    #[test]
    fn test_openai_without_api_key_is_fatal() {
        let cfg = providers_yaml("mock", "mock", "openai");
        let err = ProviderRegistry::from_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::MissingProviderOption { .. }));
    }

    #[test]
    fn test_wav_bytes_header() {
        let pcm = vec![0_i16; 960];
        let wav = wav_bytes(&pcm, 16000);
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 960 * 2);
    }
}
