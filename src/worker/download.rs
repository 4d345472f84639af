use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{TransferError, TransportError};
use crate::listener::DownloadListener;
use crate::pool::WorkerPool;
use crate::progress::{ByteCount, ProgressTracker};
use crate::task::{DownloadInfo, TaskState};
use crate::transport::{RequestDescriptor, Transport};
use crate::worker::{TaskOutcome, TransferWorker};

/// 下载执行者。
///
/// 独占驱动一个下载任务：从传输层拉字节流写入临时文件，
/// 成功后移动到保存路径；状态迁移、进度上报和监听器回调
/// 都从任务池的执行上下文发出。任务状态只被这个 worker 修改。
pub struct DownloadWorker {
    info: Mutex<DownloadInfo>,
    listener: Option<Arc<dyn DownloadListener>>,
    transport: Arc<dyn Transport>,
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
    started: AtomicBool,
    tracker: ProgressTracker,
    terminal_error: Mutex<Option<Arc<TransferError>>>,
    state_tx: watch::Sender<TaskState>,
}

impl DownloadWorker {
    /// 创建 worker；URL 非法在这里就报配置错误，不产生任何状态迁移
    pub fn new(
        info: DownloadInfo,
        listener: Option<Arc<dyn DownloadListener>>,
        transport: Arc<dyn Transport>,
        pool: Arc<WorkerPool>,
    ) -> Result<Arc<Self>, TransferError> {
        url::Url::parse(&info.task.url)
            .map_err(|e| TransferError::Configuration(format!("无效的下载地址 {}: {}", info.task.url, e)))?;
        let cancel = pool.child_token();
        let (state_tx, _) = watch::channel(TaskState::Waiting);
        Ok(Arc::new(Self {
            info: Mutex::new(info),
            listener,
            transport,
            pool,
            cancel,
            started: AtomicBool::new(false),
            tracker: ProgressTracker::new(),
            terminal_error: Mutex::new(None),
            state_tx,
        }))
    }

    /// 启动任务，立即返回。重复调用是 no-op。
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = Arc::clone(self);
        if !self.pool.spawn(async move { worker.execute(true).await }) {
            // 池已关闭，任务直接走取消终态而不是悄悄消失
            self.cancel.cancel();
            self.transition(TaskState::Cancelled, Some(TransferError::Cancelled));
        }
    }

    /// 请求中止。不阻塞、不报错；终态后调用是 no-op。
    pub fn cancel(&self) {
        if self.is_disposed() {
            return;
        }
        self.cancel.cancel();
        // 尚未启动：直接进入取消终态，传输层不会被调用
        if !self.started.load(Ordering::SeqCst) {
            self.transition(TaskState::Cancelled, Some(TransferError::Cancelled));
        }
    }

    pub fn state(&self) -> TaskState {
        self.info.lock().unwrap().task.state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TaskState::Active
    }

    pub fn is_disposed(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn snapshot(&self) -> DownloadInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 等任务到达终态
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome {
            info: self.info.lock().unwrap().task.clone(),
            error: self.terminal_error.lock().unwrap().clone(),
        }
    }

    /// 同步变体：在当前任务内执行到终态，结果里带着错误或取消标记。
    /// 已经 start 过时只是等它结束。
    pub async fn run_sync(self: &Arc<Self>) -> TaskOutcome {
        if !self.started.swap(true, Ordering::SeqCst) {
            Arc::clone(self).execute(false).await;
        } else {
            self.wait().await;
        }
        self.outcome()
    }

    async fn execute(self: Arc<Self>, pooled: bool) {
        let _permit = if pooled {
            let permit = tokio::select! {
                permit = self.pool.acquire() => permit,
                _ = self.cancel.cancelled() => None,
            };
            match permit {
                Some(p) => Some(p),
                None => {
                    // 排队阶段被取消，或池已关闭
                    self.transition(TaskState::Cancelled, Some(TransferError::Cancelled));
                    return;
                }
            }
        } else {
            None
        };
        if self.cancel.is_cancelled() {
            self.transition(TaskState::Cancelled, Some(TransferError::Cancelled));
            return;
        }
        if !self.transition(TaskState::Active, None) {
            return;
        }
        match self.fetch().await {
            Ok(()) => {
                self.transition(TaskState::Completed, None);
            }
            Err(err) => {
                let temp = self.info.lock().unwrap().temp_path();
                let _ = tokio::fs::remove_file(&temp).await;
                if self.cancel.is_cancelled() || err.is_cancelled() {
                    self.transition(TaskState::Cancelled, Some(TransferError::Cancelled));
                } else {
                    self.transition(TaskState::Error, Some(err));
                }
            }
        }
    }

    async fn fetch(&self) -> Result<(), TransferError> {
        let (tag, url, save_path, temp_path) = {
            let info = self.info.lock().unwrap();
            (
                info.task.tag.clone(),
                info.task.url.clone(),
                info.save_path.clone(),
                info.temp_path(),
            )
        };
        let response = tokio::select! {
            resp = self.transport.execute(RequestDescriptor::get(url.as_str()), None, &self.cancel) => resp?,
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        if !response.meta.is_successful() {
            return Err(TransportError::Status(response.meta.status).into());
        }
        let total = response.meta.content_length();
        self.info.lock().unwrap().task.set_total(total);

        if let Some(parent) = save_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(TransportError::Io)?;
            }
        }
        debug!("开始下载: {} -> {}", url, save_path.display());
        let mut file = tokio::fs::File::create(&temp_path).await.map_err(TransportError::Io)?;
        let mut body = response.body;
        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(TransferError::Transport)?;
            file.write_all(&chunk).await.map_err(TransportError::Io)?;
            self.report_progress(&tag, chunk.len() as u64, total);
        }
        file.flush().await.map_err(TransportError::Io)?;
        drop(file);

        // 总量已知时，保证终态前最后一次进度等于总量
        if let Some((current, total)) = self.tracker.finish(&tag) {
            self.emit_progress(&tag, current, Some(total));
        }
        // 临时文件写完才移动到保存路径，失败的下载不会留下半截目标文件
        if tokio::fs::rename(&temp_path, &save_path).await.is_err() {
            tokio::fs::copy(&temp_path, &save_path).await.map_err(TransportError::Io)?;
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        Ok(())
    }

    // 终态后的进度上报直接丢弃；去重后的值同时进任务状态和监听器
    fn report_progress(&self, name: &str, delta: u64, total: Option<u64>) {
        let update = {
            let mut info = self.info.lock().unwrap();
            if info.task.state.is_terminal() {
                return;
            }
            match self.tracker.report(name, ByteCount::Delta(delta), total) {
                Some((current, total)) => {
                    info.task.record_progress(current);
                    Some((current, total))
                }
                None => None,
            }
        };
        if let Some((current, total)) = update {
            if let Some(listener) = &self.listener {
                listener.on_progress(name, current, total);
            }
        }
    }

    fn emit_progress(&self, name: &str, current: u64, total: Option<u64>) {
        {
            let mut info = self.info.lock().unwrap();
            if info.task.state.is_terminal() {
                return;
            }
            info.task.record_progress(current);
        }
        if let Some(listener) = &self.listener {
            listener.on_progress(name, current, total);
        }
    }

    // 迁移成功返回 true 并恰好回调一次监听器；终态后的迁移一律被拒绝
    fn transition(&self, next: TaskState, error: Option<TransferError>) -> bool {
        let snapshot = {
            let mut info = self.info.lock().unwrap();
            if !info.task.advance(next) {
                return false;
            }
            info.task.clone()
        };
        let error = error.map(Arc::new);
        if let Some(err) = &error {
            *self.terminal_error.lock().unwrap() = Some(Arc::clone(err));
        }
        self.state_tx.send_replace(next);
        match next {
            TaskState::Active => debug!("开始下载任务: {}", snapshot.tag),
            TaskState::Completed => info!("✅ 下载任务完成: {}", snapshot.tag),
            TaskState::Cancelled => info!("下载任务已取消: {}", snapshot.tag),
            TaskState::Error => error!(
                "❌ 下载任务失败: {}, 错误: {}",
                snapshot.tag,
                error.as_deref().map(ToString::to_string).unwrap_or_default()
            ),
            TaskState::Waiting => {}
        }
        if let Some(listener) = &self.listener {
            let err = match next {
                TaskState::Error => error.as_deref(),
                _ => None,
            };
            listener.on_state_change(&snapshot, err);
        }
        true
    }
}

#[async_trait]
impl TransferWorker for DownloadWorker {
    fn tag(&self) -> String {
        self.info.lock().unwrap().task.tag.clone()
    }

    fn state(&self) -> TaskState {
        DownloadWorker::state(self)
    }

    fn cancel(&self) {
        DownloadWorker::cancel(self);
    }

    async fn wait(&self) -> TaskState {
        DownloadWorker::wait(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DownloadInfo;
    use crate::testing::{RecordingListener, ScriptedTransport, Stage};
    use bytes::Bytes;
    use std::time::Duration;

    const URL: &str = "http://example.com/file.bin";

    fn chunked_transport(chunks: Vec<&'static [u8]>) -> Arc<ScriptedTransport> {
        let transport = ScriptedTransport::new();
        transport.route_ok(URL, 200, chunks.into_iter().map(Bytes::from_static).collect(), true);
        transport
    }

    #[tokio::test]
    async fn test_two_chunk_download_progress_sequence() {
        crate::testing::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("file.bin");
        let transport = chunked_transport(vec![&[1u8; 400], &[2u8; 600]]);
        let listener = RecordingListener::shared();
        let pool = WorkerPool::new(2);
        let info = DownloadInfo::with_tag("t1", URL, &save_path);
        let worker =
            DownloadWorker::new(info, Some(listener.clone()), transport.clone(), pool).unwrap();
        worker.start();
        assert_eq!(worker.wait().await, TaskState::Completed);

        // 进度回调序列: (400,1000) 然后 (1000,1000)，随后恰好一次 Completed
        assert_eq!(
            listener.progress_of("t1"),
            vec![(400, Some(1000)), (1000, Some(1000))]
        );
        assert_eq!(
            listener.states_of("t1"),
            vec![TaskState::Active, TaskState::Completed]
        );
        let written = tokio::fs::read(&save_path).await.unwrap();
        assert_eq!(written.len(), 1000);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let transport = chunked_transport(vec![b"data"]);
        let listener = RecordingListener::shared();
        let pool = WorkerPool::new(2);
        let worker = DownloadWorker::new(
            DownloadInfo::with_tag("t1", URL, dir.path().join("a.bin")),
            Some(listener.clone()),
            transport.clone(),
            pool,
        )
        .unwrap();
        worker.start();
        worker.start();
        worker.start();
        worker.wait().await;
        // 等一拍，确认没有第二次执行进来
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(listener.states_of("t1"), vec![TaskState::Active, TaskState::Completed]);
    }

    #[tokio::test]
    async fn test_cancel_before_start_never_touches_transport() {
        let transport = ScriptedTransport::new();
        let listener = RecordingListener::shared();
        let pool = WorkerPool::new(2);
        let worker = DownloadWorker::new(
            DownloadInfo::with_tag("t1", URL, "/tmp/never.bin"),
            Some(listener.clone()),
            transport.clone(),
            pool,
        )
        .unwrap();
        worker.cancel();
        assert_eq!(worker.state(), TaskState::Cancelled);
        assert_eq!(listener.states_of("t1"), vec![TaskState::Cancelled]);

        // 随后 start 不应再触发任何执行或回调
        worker.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.calls(), 0);
        assert_eq!(listener.states_of("t1"), vec![TaskState::Cancelled]);
    }

    #[tokio::test]
    async fn test_cancel_after_terminal_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let transport = chunked_transport(vec![b"data"]);
        let listener = RecordingListener::shared();
        let pool = WorkerPool::new(2);
        let worker = DownloadWorker::new(
            DownloadInfo::with_tag("t1", URL, dir.path().join("a.bin")),
            Some(listener.clone()),
            transport,
            pool,
        )
        .unwrap();
        worker.start();
        assert_eq!(worker.wait().await, TaskState::Completed);
        worker.cancel();
        worker.cancel();
        assert_eq!(worker.state(), TaskState::Completed);
        assert_eq!(listener.states_of("t1"), vec![TaskState::Active, TaskState::Completed]);
    }

    #[tokio::test]
    async fn test_cancel_inflight_download() {
        let transport = ScriptedTransport::new();
        transport.route(URL, Stage::Hang);
        let listener = RecordingListener::shared();
        let pool = WorkerPool::new(2);
        let worker = DownloadWorker::new(
            DownloadInfo::with_tag("t1", URL, "/tmp/hang.bin"),
            Some(listener.clone()),
            transport.clone(),
            pool,
        )
        .unwrap();
        worker.start();
        while !worker.is_active() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        worker.cancel();
        assert_eq!(worker.wait().await, TaskState::Cancelled);
        let outcome = worker.outcome();
        assert!(outcome.is_cancelled());
        assert!(matches!(
            outcome.error.as_deref(),
            Some(TransferError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_reaches_error_state() {
        let transport = ScriptedTransport::new();
        transport.route(URL, Stage::FailConnect);
        let listener = RecordingListener::shared();
        let pool = WorkerPool::new(2);
        let worker = DownloadWorker::new(
            DownloadInfo::with_tag("t1", URL, "/tmp/fail.bin"),
            Some(listener.clone()),
            transport,
            pool,
        )
        .unwrap();
        worker.start();
        assert_eq!(worker.wait().await, TaskState::Error);
        assert!(listener.error_of("t1"));
        let outcome = worker.outcome();
        assert!(matches!(
            outcome.error.as_deref(),
            Some(TransferError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_non_2xx_is_error() {
        let transport = ScriptedTransport::new();
        transport.route_ok(URL, 404, vec![], false);
        let pool = WorkerPool::new(2);
        let worker = DownloadWorker::new(
            DownloadInfo::with_tag("t1", URL, "/tmp/404.bin"),
            None,
            transport,
            pool,
        )
        .unwrap();
        worker.start();
        assert_eq!(worker.wait().await, TaskState::Error);
        assert!(matches!(
            worker.outcome().error.as_deref(),
            Some(TransferError::Transport(TransportError::Status(404)))
        ));
    }

    #[tokio::test]
    async fn test_mid_stream_failure() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new();
        transport.route(URL, Stage::FailMidStream { first: Bytes::from_static(&[0u8; 100]) });
        let listener = RecordingListener::shared();
        let pool = WorkerPool::new(2);
        let save_path = dir.path().join("broken.bin");
        let worker = DownloadWorker::new(
            DownloadInfo::with_tag("t1", URL, &save_path),
            Some(listener.clone()),
            transport,
            pool,
        )
        .unwrap();
        worker.start();
        assert_eq!(worker.wait().await, TaskState::Error);
        // 失败的下载不产出目标文件
        assert!(!save_path.exists());
    }

    #[tokio::test]
    async fn test_run_sync_returns_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let transport = chunked_transport(vec![b"hello"]);
        let pool = WorkerPool::new(2);
        let worker = DownloadWorker::new(
            DownloadInfo::with_tag("t1", URL, dir.path().join("s.bin")),
            None,
            transport,
            pool,
        )
        .unwrap();
        let outcome = worker.run_sync().await;
        assert!(outcome.is_successful());
        assert!(outcome.error.is_none());
        assert_eq!(outcome.info.current_size, 5);
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let pool = WorkerPool::new(1);
        let result = DownloadWorker::new(
            DownloadInfo::new("没有协议的地址", "/tmp/x.bin"),
            None,
            ScriptedTransport::new(),
            pool,
        );
        assert!(matches!(result, Err(TransferError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_pool_shutdown_resolves_waiting_task() {
        let transport = ScriptedTransport::new();
        transport.route(URL, Stage::Hang);
        let listener = RecordingListener::shared();
        let pool = WorkerPool::new(1);
        let blocker = DownloadWorker::new(
            DownloadInfo::with_tag("hog", URL, "/tmp/hog.bin"),
            None,
            transport.clone(),
            Arc::clone(&pool),
        )
        .unwrap();
        blocker.start();
        while !blocker.is_active() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // 第二个任务还在排队，池关闭后它也必须得到终态回调
        let queued = DownloadWorker::new(
            DownloadInfo::with_tag("queued", URL, "/tmp/queued.bin"),
            Some(listener.clone()),
            transport,
            Arc::clone(&pool),
        )
        .unwrap();
        queued.start();
        pool.shutdown().await;
        assert_eq!(blocker.state(), TaskState::Cancelled);
        assert_eq!(queued.state(), TaskState::Cancelled);
        assert_eq!(listener.states_of("queued"), vec![TaskState::Cancelled]);
    }
}
