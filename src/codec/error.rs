use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u8),
    #[error("unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),
    #[error("opus decoder init failed: {0}")]
    DecoderInit(String),
    #[error("opus encoder init failed: {0}")]
    EncoderInit(String),
    #[error("opus decode failed: {0}")]
    Decode(String),
    #[error("opus encode failed: {0}")]
    Encode(String),
}
