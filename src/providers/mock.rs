//! モックプロバイダ実装
//!
//! 外部APIへ接続せずにセッションエンジン全体を動かすための実装。
//! テストとローカル開発で使用します。
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::codec::{CodecError, OpusFrameEncoder};
use crate::config::ProviderOptions;
use crate::segmenter::{AudioFormat, AudioFrame};

use super::error::ProviderError;
use super::{AsrProvider, ChatMessage, ChatStream, LlmProvider, TtsProvider};

/// 固定テキストを返すASRモック
///
/// オプション `transcript` で認識結果を差し替え可能。空音声には
/// 契約どおり空文字列を返します。
pub struct MockAsrProvider {
    transcript: String,
    output_dir: Option<PathBuf>,
}

impl MockAsrProvider {
    pub fn new(options: ProviderOptions) -> Self {
        Self {
            transcript: options
                .get_str("transcript")
                .unwrap_or_else(|| "こんにちは".to_string()),
            output_dir: options.get_str("output_dir").map(PathBuf::from),
        }
    }
}

#[async_trait]
impl AsrProvider for MockAsrProvider {
    async fn recognize(
        &self,
        frames: &[AudioFrame],
        _format: AudioFormat,
        session_id: &str,
    ) -> Result<(String, Option<PathBuf>), ProviderError> {
        if frames.iter().all(|f| f.pcm.is_empty()) {
            return Ok((String::new(), None));
        }

        let artifact = match &self.output_dir {
            Some(dir) => {
                let pcm: Vec<i16> = frames.iter().flat_map(|f| f.pcm.iter().copied()).collect();
                Some(super::write_wav_artifact(dir, session_id, &pcm, 16000)?)
            }
            None => None,
        };

        Ok((self.transcript.clone(), artifact))
    }
}

/// 無音Opusフレームを合成するTTSモック
pub struct MockTtsProvider {
    encoder: Mutex<OpusFrameEncoder>,
    frames_per_reply: usize,
}

impl MockTtsProvider {
    pub fn new(options: ProviderOptions) -> Result<Self, CodecError> {
        let frames_per_reply = options
            .get_str("frames_per_reply")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        let encoder = OpusFrameEncoder::new(16000, 1)?;
        Ok(Self {
            encoder: Mutex::new(encoder),
            frames_per_reply,
        })
    }
}

#[async_trait]
impl TtsProvider for MockTtsProvider {
    async fn synthesize(&self, _text: &str) -> Result<Vec<Bytes>, ProviderError> {
        let silence = vec![0_i16; 960];
        let mut encoder = self.encoder.lock();
        let mut frames = Vec::with_capacity(self.frames_per_reply);
        for _ in 0..self.frames_per_reply {
            frames.push(encoder.encode(&silence)?);
        }
        Ok(frames)
    }
}

/// 固定応答をチャンク分割して流すLLMモック
///
/// `chunk_delay_ms` でストリーミングの間隔を模擬できます
/// （割り込みテストで使用）。
pub struct MockLlmProvider {
    reply: String,
    chunk_delay: std::time::Duration,
}

impl MockLlmProvider {
    pub fn new(options: ProviderOptions) -> Self {
        let chunk_delay_ms = options
            .get_str("chunk_delay_ms")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0_u64);
        Self {
            reply: options
                .get_str("reply")
                .unwrap_or_else(|| "はい、承知しました。".to_string()),
            chunk_delay: std::time::Duration::from_millis(chunk_delay_ms),
        }
    }
}

impl LlmProvider for MockLlmProvider {
    fn converse(&self, _context: &[ChatMessage]) -> ChatStream {
        let (tx, rx) = mpsc::channel::<Result<String, ProviderError>>(8);
        let reply = self.reply.clone();
        let chunk_delay = self.chunk_delay;
        tokio::spawn(async move {
            let chars: Vec<char> = reply.chars().collect();
            for chunk in chars.chunks(8) {
                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
                let piece: String = chunk.iter().collect();
                if tx.send(Ok(piece)).await.is_err() {
                    // 受信側破棄＝応答キャンセル
                    return;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}
