//! 接続マネージャ
//!
//! WebSocket接続の受け入れ、トークン認証、セッションの生成/破棄、
//! プロセス全体のシャットダウン調整を行います。認証キーは起動後不変のため
//! 読み取りに同期は不要です。認証失敗はクローズコード1008で即時拒否します。
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{info, warn};

use crate::config::{AuthConfig, ConfigSet};
use crate::providers::ProviderRegistry;
use crate::report::ReportHandle;
use crate::session;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(std::io::Error),
    #[error("accept error: {0}")]
    Accept(std::io::Error),
}

/// 全セッションで共有する依存一式（起動後は読み取り専用）
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ConfigSet>,
    pub registry: Arc<ProviderRegistry>,
    pub report: ReportHandle,
}

/// 設定のアドレスにバインドしてサーバを起動
pub async fn bind_and_run(
    ctx: ServerContext,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(&ctx.config.server.ws_bind_addr)
        .await
        .map_err(ServerError::Bind)?;
    run_with_listener(listener, ctx, shutdown_rx).await
}

/// 既存の`TcpListener`でサーバを起動（テストでも使用）
pub async fn run_with_listener(
    listener: TcpListener,
    ctx: ServerContext,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "websocket server listening");
    }

    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => return Err(ServerError::Accept(e)),
                };

                // 終了済みセッションを回収してから上限を判定
                while sessions.try_join_next().is_some() {}
                if sessions.len() >= ctx.config.server.max_concurrent_sessions {
                    warn!(%peer_addr, "セッション数上限に達したため接続を拒否");
                    drop(stream);
                    continue;
                }

                let ctx = ctx.clone();
                let shutdown = shutdown_rx.clone();
                sessions.spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx, shutdown).await {
                        warn!(%peer_addr, error = %e, "connection handling failed");
                    }
                });
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    // 各セッションはシャットダウン通知を受けて自律的に閉じる。
    // ドレインタイムアウト超過分は強制破棄（報告のみ、再試行しない）
    let drain = ctx.config.server.drain_timeout();
    info!(sessions = sessions.len(), "シャットダウン開始、セッションのドレインを待機");
    let all_done = tokio::time::timeout(drain, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if all_done.is_err() {
        warn!(remaining = sessions.len(), "ドレインタイムアウト、残セッションを強制終了");
        sessions.abort_all();
    }
    info!("server stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    ctx: ServerContext,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), String> {
    // ハンドシェイク時のHTTPリクエストから認証トークンを取り出す
    let mut supplied_token: Option<String> = None;
    let ws = accept_hdr_async(stream, |req: &Request, resp| {
        supplied_token = extract_token(req);
        Ok(resp)
    })
    .await
    .map_err(|e| format!("websocket handshake failed: {e}"))?;

    if !authorize(&ctx.config.server.auth, supplied_token.as_deref()) {
        warn!("認証失敗、接続を拒否");
        reject_unauthorized(ws).await;
        return Ok(());
    }

    session::run_session(ws, ctx.config, ctx.registry, ctx.report, shutdown_rx).await;
    Ok(())
}

/// Authorizationヘッダ（Bearer）またはクエリ `token` からトークンを取得
fn extract_token(req: &Request) -> Option<String> {
    if let Some(value) = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str())?;
    extract_query_param(path_and_query, "token")
}

fn extract_query_param(path_and_query: &str, key: &str) -> Option<String> {
    // 例: "/assistant/v1?token=abc-123"
    let query = path_and_query.split('?').nth(1)?;
    for pair in query.split('&') {
        let mut kv = pair.splitn(2, '=');
        if let (Some(k), Some(v)) = (kv.next(), kv.next()) {
            if k == key && !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// プロセス全体の認証キーと照合
fn authorize(auth: &AuthConfig, token: Option<&str>) -> bool {
    if !auth.enabled {
        return true;
    }
    match token {
        Some(token) => !auth.auth_key.is_empty() && token == auth.auth_key,
        None => false,
    }
}

/// 認証失敗時はセッションを作らずクローズコード1008で切断
async fn reject_unauthorized<S>(ws: WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut tx, _rx) = ws.split();
    let close = Message::Close(Some(CloseFrame {
        code: CloseCode::Policy,
        reason: "authentication failed".into(),
    }));
    let _ = tx.send(close).await;
}
