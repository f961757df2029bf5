//! 音声処理に関する設定値
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub input: InputFormat,
    pub vad: VadConfig,
    pub segmenter: SegmenterConfig,
}

impl AudioConfig {
    /// 1フレームあたりのサンプル数を計算（例: 16kHz × 60ms = 960）
    pub fn frame_samples(&self) -> usize {
        (self.input.sample_rate_hz as usize * self.input.frame_duration_ms as usize) / 1000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputFormat {
    pub sample_rate_hz: u32,
    pub channels: u8,
    pub frame_duration_ms: u32,
}

/// エネルギーVADの閾値設定
#[derive(Debug, Clone, Deserialize)]
pub struct VadConfig {
    /// 音声ありと判定するRMS閾値（i16振幅）
    pub energy_threshold: f32,
    /// 音声判定を保持するハングオーバーフレーム数
    pub hangover_frames: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmenterConfig {
    /// 無音時にバッファへ残すプリロールフレーム数
    #[serde(default = "default_pre_roll_frames")]
    pub pre_roll_frames: usize,
    /// 発話として認識へ回す最小フレーム数
    #[serde(default = "default_min_utterance_frames")]
    pub min_utterance_frames: usize,
    /// auto/realtimeモードで発話終了とみなす連続無音フレーム数
    #[serde(default = "default_silence_stop_frames")]
    pub silence_stop_frames: usize,
}

fn default_pre_roll_frames() -> usize {
    10
}

fn default_min_utterance_frames() -> usize {
    15
}

fn default_silence_stop_frames() -> usize {
    8
}
