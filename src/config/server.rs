use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// WebSocketサーバのバインドアドレス（例: 0.0.0.0:8000）
    pub ws_bind_addr: String,
    pub auth: AuthConfig,
    /// シャットダウン時にセッション完了を待つ秒数
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// 同時接続セッション数の上限
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.drain_timeout_secs)
    }
}

/// 接続時トークン認証の設定
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub enabled: bool,
    /// プロセス全体で共有する認証キー。空の場合は起動時にランダム生成
    #[serde(default)]
    pub auth_key: String,
}

fn default_drain_timeout_secs() -> u64 {
    3
}

fn default_max_sessions() -> usize {
    64
}
