//! 認識結果の補助レポート送出
//!
//! 認識された発話をログ/分析用にfire-and-forgetで流します。
//! キューが詰まっても落としてよく、セッション処理には影響させません。
use tokio::sync::mpsc;
use tracing::{debug, info};

/// 1発話分のレポート
#[derive(Debug, Clone)]
pub struct UtteranceReport {
    pub session_id: String,
    pub text: String,
    pub frame_count: usize,
}

/// レポート送出ハンドル（クローンして各セッションへ配布）
#[derive(Clone)]
pub struct ReportHandle {
    tx: mpsc::Sender<UtteranceReport>,
}

impl ReportHandle {
    /// レポートを非ブロッキングで投入。失敗は破棄するだけ
    pub fn enqueue(&self, report: UtteranceReport) {
        if let Err(e) = self.tx.try_send(report) {
            debug!(error = %e, "レポートキューへ投入できず破棄");
        }
    }
}

/// レポート消費タスクを起動してハンドルを返す
pub fn spawn_sink() -> ReportHandle {
    let (tx, mut rx) = mpsc::channel::<UtteranceReport>(256);
    tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            info!(
                session_id = %report.session_id,
                frames = report.frame_count,
                text = %report.text,
                "utterance recognized"
            );
        }
    });
    ReportHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_is_fire_and_forget() {
        let handle = spawn_sink();
        for i in 0..1000 {
            // キューが溢れてもパニックせず戻ってくること
            handle.enqueue(UtteranceReport {
                session_id: "s1".to_string(),
                text: format!("utterance {i}"),
                frame_count: 20,
            });
        }
    }
}
