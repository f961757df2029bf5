//! フレーム単位の音声区間検出（VAD）
//!
//! セグメンタへ渡す「音声あり」フラグを外部検出器として供給します。
//! 既定実装はRMSエネルギー閾値＋ハングオーバー方式。差し替えは
//! `VoiceActivityDetector` トレイトの実装で行います。
use crate::config::VadConfig;

/// フレームごとに音声の有無を判定する検出器
pub trait VoiceActivityDetector: Send {
    /// PCMフレーム1つを観測し、音声ありなら true
    fn detect(&mut self, pcm: &[i16]) -> bool;

    /// 発話リセット時に内部状態をクリア
    fn reset(&mut self);
}

/// RMSエネルギー閾値ベースの検出器
///
/// 閾値を超えたフレームのあと `hangover_frames` フレームは
/// 音声ありのまま維持し、語尾の弱いエネルギーで途切れないようにします。
pub struct EnergyVad {
    threshold: f32,
    hangover_frames: u32,
    remaining_hangover: u32,
}

impl EnergyVad {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            threshold: config.energy_threshold,
            hangover_frames: config.hangover_frames,
            remaining_hangover: 0,
        }
    }

    fn rms(pcm: &[i16]) -> f32 {
        if pcm.is_empty() {
            return 0.0;
        }
        let sum: f64 = pcm.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / pcm.len() as f64).sqrt() as f32
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn detect(&mut self, pcm: &[i16]) -> bool {
        if Self::rms(pcm) >= self.threshold {
            self.remaining_hangover = self.hangover_frames;
            return true;
        }
        if self.remaining_hangover > 0 {
            self.remaining_hangover -= 1;
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.remaining_hangover = 0;
    }
}
