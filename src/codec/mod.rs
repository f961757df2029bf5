//! Opusコーデックアダプタ
//!
//! 受信した圧縮フレームを固定フォーマットPCM（モノラル/16kHz/16bit）へ
//! デコードします。壊れたパケットはエラーで返し、呼び出し側が警告を
//! 出してスキップします。デコーダー状態は汚染されず後続のデコードは
//! 継続できます（1パケットの破損で発話全体を失わない）。
mod error;

use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Channels, SampleRate};
use bytes::Bytes;
use tracing::debug;

pub use error::CodecError;

fn opus_channels(channels: u8) -> Result<Channels, CodecError> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        _ => Err(CodecError::UnsupportedChannels(channels)),
    }
}

fn opus_sample_rate(sample_rate: u32) -> Result<SampleRate, CodecError> {
    match sample_rate {
        8000 => Ok(SampleRate::Hz8000),
        12000 => Ok(SampleRate::Hz12000),
        16000 => Ok(SampleRate::Hz16000),
        24000 => Ok(SampleRate::Hz24000),
        48000 => Ok(SampleRate::Hz48000),
        _ => Err(CodecError::UnsupportedSampleRate(sample_rate)),
    }
}

/// Opusデコーダーラッパー
pub struct OpusFrameDecoder {
    decoder: OpusDecoder,
    channels: usize,
    frame_samples: usize,
}

// SAFETY: audiopus::coder::Decoder is Send but not Sync because it wraps a raw
// pointer. OpusFrameDecoder only touches the decoder through `&mut self`, so a
// shared reference can never reach the underlying pointer.
unsafe impl Sync for OpusFrameDecoder {}

impl OpusFrameDecoder {
    /// 新しいOpusデコーダーを作成
    pub fn new(sample_rate: u32, channels: u8, frame_samples: usize) -> Result<Self, CodecError> {
        let decoder = OpusDecoder::new(opus_sample_rate(sample_rate)?, opus_channels(channels)?)
            .map_err(|e| CodecError::DecoderInit(format!("{e:?}")))?;

        Ok(Self {
            decoder,
            channels: channels as usize,
            frame_samples,
        })
    }

    /// Opusパケットを1つデコード
    pub fn decode(&mut self, packet: &Bytes) -> Result<Vec<i16>, CodecError> {
        let mut output = vec![0_i16; self.frame_samples * self.channels];

        let packet = audiopus::packet::Packet::try_from(packet.as_ref())
            .map_err(|e| CodecError::Decode(format!("{e:?}")))?;
        let signals = audiopus::MutSignals::try_from(&mut output[..])
            .map_err(|e| CodecError::Decode(format!("{e:?}")))?;
        let decoded_samples = self
            .decoder
            .decode(Some(packet), signals, false)
            .map_err(|e| CodecError::Decode(format!("{e:?}")))?;

        output.truncate(decoded_samples * self.channels);

        debug!(samples = decoded_samples, "Opusデコード完了");

        Ok(output)
    }
}

/// Opusエンコーダーラッパー（下りフレーム生成とテストで使用）
pub struct OpusFrameEncoder {
    encoder: OpusEncoder,
}

impl OpusFrameEncoder {
    pub fn new(sample_rate: u32, channels: u8) -> Result<Self, CodecError> {
        let encoder = OpusEncoder::new(
            opus_sample_rate(sample_rate)?,
            opus_channels(channels)?,
            Application::Voip,
        )
        .map_err(|e| CodecError::EncoderInit(format!("{e:?}")))?;

        Ok(Self { encoder })
    }

    /// PCMフレームを1つのOpusパケットへエンコード
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        // Opusの最大パケット長に余裕を持たせたバッファ
        let mut output = vec![0_u8; 4000];
        let written = self
            .encoder
            .encode(pcm, &mut output)
            .map_err(|e| CodecError::Encode(format!("{e:?}")))?;
        output.truncate(written);
        Ok(Bytes::from(output))
    }
}
