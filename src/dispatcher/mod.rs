//! 認識ディスパッチャ
//!
//! セッションごとに1本のワーカースレッドを持ち、確定した発話
//! （`RecognitionTask`）をFIFOで処理します。実際のプロバイダ呼び出しは
//! イベントループ側で実行し、ワーカーは結果スロット（oneshot）の完了を
//! ブロッキングで待つことで以下を保証します:
//!
//! - セッションあたり同時1件の認識呼び出し
//! - 発話が確定した順での認識
//! - イベントループは遅いプロバイダ呼び出しでブロックされない
//! - 1件の失敗はログのみでワーカーは継続
//!
//! キュー取得は1秒のタイムアウト付きで、停止フラグを有界遅延で観測します。
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::segmenter::RecognitionTask;

/// 停止フラグの観測間隔を兼ねたキュー待ち時間
pub const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to spawn dispatcher worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("recognition queue closed")]
    QueueClosed,
}

/// イベントループ側で実行する認識ジョブ
///
/// ワーカーは `result_tx` の対になる受信側をブロッキングで待ち、
/// 完了（成否問わず）を観測してから次のタスクを取り出します。
#[derive(Debug)]
pub struct RecognitionJob {
    pub task: RecognitionTask,
    pub result_tx: oneshot::Sender<Result<(), String>>,
}

pub struct RecognitionDispatcher {
    task_tx: std_mpsc::Sender<RecognitionTask>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    session_id: String,
}

impl RecognitionDispatcher {
    /// ワーカースレッドを起動。ジョブは `job_tx` 経由でループ側へ渡される
    pub fn start(
        session_id: impl Into<String>,
        job_tx: mpsc::Sender<RecognitionJob>,
    ) -> Result<Self, DispatchError> {
        let session_id = session_id.into();
        let (task_tx, task_rx) = std_mpsc::channel::<RecognitionTask>();
        let stop_flag = Arc::new(AtomicBool::new(false));

        let flag = stop_flag.clone();
        let worker_session_id = session_id.clone();
        let worker = thread::Builder::new()
            .name(format!("recognition-{session_id}"))
            .spawn(move || worker_loop(worker_session_id, task_rx, job_tx, flag))
            .map_err(DispatchError::Spawn)?;

        Ok(Self {
            task_tx,
            stop_flag,
            worker: Some(worker),
            session_id,
        })
    }

    /// 発話をキューへ追加（FIFO）
    pub fn enqueue(&self, task: RecognitionTask) -> Result<(), DispatchError> {
        self.task_tx.send(task).map_err(|_| DispatchError::QueueClosed)
    }

    /// 停止フラグを立てる（ワーカーは次のキュー待ちまでに観測）
    pub fn signal_stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// 停止してワーカーの終了を待つ。`drain` を超えたら放置して諦める
    ///
    /// 戻り値はワーカーが時間内にjoinできたかどうか。
    pub async fn shutdown(mut self, drain: Duration) -> bool {
        self.signal_stop();
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let session_id = self.session_id.clone();
        // task_tx を落としてキューを閉じる
        drop(self);

        let join = tokio::task::spawn_blocking(move || {
            let _ = worker.join();
        });
        match tokio::time::timeout(drain, join).await {
            Ok(_) => true,
            Err(_) => {
                warn!(session_id = %session_id, "dispatcher drain timeout, abandoning worker");
                false
            }
        }
    }
}

fn worker_loop(
    session_id: String,
    task_rx: std_mpsc::Receiver<RecognitionTask>,
    job_tx: mpsc::Sender<RecognitionJob>,
    stop_flag: Arc<AtomicBool>,
) {
    while !stop_flag.load(Ordering::Relaxed) {
        match task_rx.recv_timeout(QUEUE_POLL_TIMEOUT) {
            Ok(task) => {
                let (result_tx, result_rx) = oneshot::channel();
                let job = RecognitionJob { task, result_tx };
                if job_tx.blocking_send(job).is_err() {
                    // ループ側が閉じた＝セッション終了
                    break;
                }
                // 現在の呼び出しが完了するまで次のタスクを取り出さない
                match result_rx.blocking_recv() {
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => {
                        warn!(
                            session_id = %session_id,
                            error = %message,
                            "認識呼び出しに失敗、次のタスクへ継続"
                        );
                    }
                    Err(_) => {
                        // 結果スロットが破棄された＝セッション終了中
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(session_id = %session_id, "dispatcher worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::segmenter::{AudioFormat, AudioFrame, RecognitionTask};

    fn task(session_id: &str, marker: usize) -> RecognitionTask {
        RecognitionTask {
            session_id: session_id.to_string(),
            frames: vec![
                AudioFrame {
                    pcm: vec![0_i16; marker],
                    have_voice: true,
                };
                1
            ],
            format: AudioFormat::Pcm,
        }
    }

    #[tokio::test]
    async fn test_tasks_processed_in_order_single_flight() {
        let (job_tx, mut job_rx) = mpsc::channel::<RecognitionJob>(1);
        let dispatcher = RecognitionDispatcher::start("s1", job_tx).expect("start");

        for i in 1..=5 {
            dispatcher.enqueue(task("s1", i)).expect("enqueue");
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let job = job_rx.recv().await.expect("job");
            // 前のジョブの完了前に次のジョブは到着しない（単一チャネル受信で直列）
            seen.push(job.task.frames[0].pcm.len());
            job.result_tx.send(Ok(())).expect("result");
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);

        assert!(dispatcher.shutdown(Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_worker() {
        let (job_tx, mut job_rx) = mpsc::channel::<RecognitionJob>(1);
        let dispatcher = RecognitionDispatcher::start("s1", job_tx).expect("start");

        dispatcher.enqueue(task("s1", 1)).expect("enqueue");
        dispatcher.enqueue(task("s1", 2)).expect("enqueue");

        let first = job_rx.recv().await.expect("job");
        first
            .result_tx
            .send(Err("provider unavailable".to_string()))
            .expect("result");

        // 失敗後も次のタスクが処理される
        let second = job_rx.recv().await.expect("job");
        assert_eq!(second.task.frames[0].pcm.len(), 2);
        second.result_tx.send(Ok(())).expect("result");

        assert!(dispatcher.shutdown(Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn test_idle_teardown_within_one_poll_cycle() {
        let (job_tx, _job_rx) = mpsc::channel::<RecognitionJob>(1);
        let dispatcher = RecognitionDispatcher::start("s1", job_tx).expect("start");

        let started = Instant::now();
        assert!(dispatcher.shutdown(Duration::from_secs(3)).await);
        // アイドル待機中の停止は1回のキュー待ちサイクル以内
        assert!(started.elapsed() < QUEUE_POLL_TIMEOUT + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_mid_call_teardown_gives_up_after_drain() {
        let (job_tx, mut job_rx) = mpsc::channel::<RecognitionJob>(1);
        let dispatcher = RecognitionDispatcher::start("s1", job_tx).expect("start");

        dispatcher.enqueue(task("s1", 1)).expect("enqueue");
        // ジョブを受け取るがあえて結果を返さず、ワーカーを結果待ちで
        // ブロックさせたままシャットダウンする
        let job = job_rx.recv().await.expect("job");

        let drain = Duration::from_secs(1);
        let started = Instant::now();
        assert!(!dispatcher.shutdown(drain).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= drain);
        // ドレイン上限を超えたら待たずに諦めて戻る
        assert!(elapsed < drain + Duration::from_secs(2));

        // 結果スロットを破棄すればワーカーは自力で終了する
        drop(job);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let (job_tx, _job_rx) = mpsc::channel::<RecognitionJob>(1);
        let dispatcher = RecognitionDispatcher::start("s1", job_tx).expect("start");
        dispatcher.signal_stop();
        // ワーカー停止後はキューが閉じる
        tokio::time::sleep(QUEUE_POLL_TIMEOUT + Duration::from_millis(200)).await;
        assert!(matches!(
            dispatcher.enqueue(task("s1", 1)),
            Err(DispatchError::QueueClosed)
        ));
    }
}
