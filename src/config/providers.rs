//! プロバイダ選択とオプションバッグの設定
//!
//! `selected` で各ケイパビリティ（asr/tts/llm）の実装名を選び、
//! 実装ごとのオプションは名前キーのマップで与えます。
//! 未知のキーは無視し、必須キーの欠落は起動時エラーとします。
use std::collections::HashMap;

use serde::Deserialize;

use super::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    pub selected: SelectedProviders,
    #[serde(default)]
    pub asr: HashMap<String, ProviderOptions>,
    #[serde(default)]
    pub tts: HashMap<String, ProviderOptions>,
    #[serde(default)]
    pub llm: HashMap<String, ProviderOptions>,
}

/// ケイパビリティごとに選択された実装名
#[derive(Debug, Clone, Deserialize)]
pub struct SelectedProviders {
    pub asr: String,
    pub tts: String,
    pub llm: String,
}

impl ProvidersConfig {
    /// 選択中のプロバイダのオプションを取得（未定義ならば空バッグ）
    pub fn options_for(&self, capability: Capability, name: &str) -> ProviderOptions {
        let table = match capability {
            Capability::Asr => &self.asr,
            Capability::Tts => &self.tts,
            Capability::Llm => &self.llm,
        };
        table.get(name).cloned().unwrap_or_default()
    }
}

/// プロバイダのケイパビリティ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Asr,
    Tts,
    Llm,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Asr => "asr",
            Capability::Tts => "tts",
            Capability::Llm => "llm",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任意キーのオプションバッグ
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderOptions(HashMap<String, serde_yaml::Value>);

impl ProviderOptions {
    /// 文字列オプションを取得（数値等は文字列化して返す）
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// 必須の文字列オプションを取得。欠落は起動時致命エラー
    pub fn require_str(
        &self,
        capability: Capability,
        name: &str,
        key: &str,
    ) -> Result<String, ConfigError> {
        self.get_str(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingProviderOption {
                capability: capability.to_string(),
                name: name.to_string(),
                key: key.to_string(),
            })
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), serde_yaml::Value::String(v.to_string())))
                .collect(),
        )
    }
}
