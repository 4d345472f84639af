use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::converter::{ConvertedResponse, ResponseConverter};
use crate::error::{TransferError, TransportError};
use crate::listener::UploadListener;
use crate::pool::WorkerPool;
use crate::progress::{ByteCount, ProgressTracker};
use crate::task::{TaskState, UploadInfo};
use crate::transport::{RequestBody, RequestDescriptor, Transport, WriteProgress};
use crate::worker::{TaskOutcome, TransferWorker};

/// 上传执行者。
///
/// 把任务的 multipart 载荷交给传输层，写进度按分部名上报，
/// 2xx 响应再经转换器产出业务结果；传输失败、非 2xx 和转换失败
/// 都收敛到 ERROR 终态，不会从任务池里抛出去。
pub struct UploadWorker<T> {
    info: Mutex<UploadInfo>,
    converter: Option<Arc<dyn ResponseConverter<Output = T>>>,
    listener: Option<Arc<dyn UploadListener<T>>>,
    transport: Arc<dyn Transport>,
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
    started: AtomicBool,
    tracker: ProgressTracker,
    terminal_error: Mutex<Option<Arc<TransferError>>>,
    response: Mutex<Option<ConvertedResponse<T>>>,
    state_tx: watch::Sender<TaskState>,
}

impl<T: Send + Sync + 'static> UploadWorker<T> {
    /// 创建 worker；URL 非法或文件缺失在这里就报配置错误
    pub fn new(
        info: UploadInfo,
        converter: Option<Arc<dyn ResponseConverter<Output = T>>>,
        listener: Option<Arc<dyn UploadListener<T>>>,
        transport: Arc<dyn Transport>,
        pool: Arc<WorkerPool>,
    ) -> Result<Arc<Self>, TransferError> {
        url::Url::parse(&info.task.url)
            .map_err(|e| TransferError::Configuration(format!("无效的上传地址 {}: {}", info.task.url, e)))?;
        for part in &info.file_parts {
            if !part.path.is_file() {
                return Err(TransferError::Configuration(format!(
                    "上传文件不存在: {}",
                    part.path.display()
                )));
            }
        }
        let cancel = pool.child_token();
        let (state_tx, _) = watch::channel(TaskState::Waiting);
        Ok(Arc::new(Self {
            info: Mutex::new(info),
            converter,
            listener,
            transport,
            pool,
            cancel,
            started: AtomicBool::new(false),
            tracker: ProgressTracker::new(),
            terminal_error: Mutex::new(None),
            response: Mutex::new(None),
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

    pub fn snapshot(&self) -> UploadInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

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

    /// 同步变体：在当前任务内执行到终态，返回转换过的响应。
    /// 被取消时结果的 error 一定被填充。
    pub async fn run_sync(self: &Arc<Self>) -> ConvertedResponse<T> {
        if !self.started.swap(true, Ordering::SeqCst) {
            Arc::clone(self).execute(false).await;
        } else {
            self.wait().await;
        }
        self.take_response()
    }

    fn take_response(&self) -> ConvertedResponse<T> {
        let mut resp = self
            .response
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(ConvertedResponse::empty);
        if resp.error.is_none() && resp.convert_error.is_none() {
            let state = self.state();
            if state != TaskState::Completed {
                resp.error = self.terminal_error.lock().unwrap().clone();
            }
        }
        resp
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
                if self.cancel.is_cancelled() || err.is_cancelled() {
                    self.transition(TaskState::Cancelled, Some(TransferError::Cancelled));
                } else {
                    self.transition(TaskState::Error, Some(err));
                }
                // 同步结果里同样要能看到失败原因
                let mut resp = self.response.lock().unwrap();
                let resp = resp.get_or_insert_with(ConvertedResponse::empty);
                if resp.error.is_none() && resp.convert_error.is_none() {
                    resp.error = self.terminal_error.lock().unwrap().clone();
                }
            }
        }
    }

    async fn fetch(self: &Arc<Self>) -> Result<(), TransferError> {
        let (url, params, files) = {
            let info = self.info.lock().unwrap();
            (
                info.task.url.clone(),
                info.param_parts.clone(),
                info.file_parts.clone(),
            )
        };
        // 总量在提交时就能确定：各文件大小之和
        let mut total = 0u64;
        for part in &files {
            total += tokio::fs::metadata(&part.path)
                .await
                .map_err(TransportError::Io)?
                .len();
        }
        self.info.lock().unwrap().task.set_total(Some(total));
        debug!("开始上传: {}, 共 {} 个文件分部, {} 字节", url, files.len(), total);

        let worker = Arc::clone(self);
        let hook: WriteProgress = Arc::new(move |name, written, part_total| {
            worker.report_progress(name, written, part_total);
        });
        let descriptor = RequestDescriptor::post(
            url.as_str(),
            RequestBody::Multipart {
                params,
                files: files.clone(),
            },
        );
        let response = tokio::select! {
            resp = self.transport.execute(descriptor, Some(hook), &self.cancel) => resp?,
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        let meta = response.meta.clone();
        let body = tokio::select! {
            body = response.bytes() => body.map_err(TransferError::Transport)?,
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
        };

        let mut converted = ConvertedResponse::with_meta(meta.clone());
        if !meta.is_successful() {
            // 原始响应本身失败，以状态码为准，转换不会发生
            *self.response.lock().unwrap() = Some(converted);
            return Err(TransportError::Status(meta.status).into());
        }

        // 成功收尾：每个分部补齐到各自总量
        let names: HashSet<String> = files.iter().map(|p| p.name.clone()).collect();
        for name in names {
            if let Some((current, part_total)) = self.tracker.finish(&name) {
                self.emit_progress(&name, current, Some(part_total));
            }
        }

        match &self.converter {
            Some(converter) => match converter.convert(body) {
                Ok(value) => {
                    if let Some(listener) = &self.listener {
                        listener.on_response(&meta, Some(&value));
                    }
                    converted.converted_body = Some(value);
                    *self.response.lock().unwrap() = Some(converted);
                    Ok(())
                }
                Err(err) => {
                    let err = Arc::new(err);
                    if let Some(listener) = &self.listener {
                        listener.on_convert_error(&err);
                    }
                    converted.convert_error = Some(Arc::clone(&err));
                    *self.response.lock().unwrap() = Some(converted);
                    Err(TransferError::Convert(err))
                }
            },
            None => {
                if let Some(listener) = &self.listener {
                    listener.on_response(&meta, None);
                }
                *self.response.lock().unwrap() = Some(converted);
                Ok(())
            }
        }
    }

    // 写进度：按分部名去重归一，任务整体进度取各分部之和
    fn report_progress(&self, name: &str, written: u64, part_total: Option<u64>) {
        let update = {
            let mut info = self.info.lock().unwrap();
            if info.task.state.is_terminal() {
                return;
            }
            match self.tracker.report(name, ByteCount::Absolute(written), part_total) {
                Some((current, total)) => {
                    let aggregate = self.tracker.total_reported();
                    info.task.record_progress(aggregate);
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
            info.task.record_progress(self.tracker.total_reported());
        }
        if let Some(listener) = &self.listener {
            listener.on_progress(name, current, total);
        }
    }

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
            TaskState::Active => debug!("开始上传任务: {}", snapshot.tag),
            TaskState::Completed => info!("✅ 上传任务完成: {}", snapshot.tag),
            TaskState::Cancelled => info!("上传任务已取消: {}", snapshot.tag),
            TaskState::Error => error!(
                "❌ 上传任务失败: {}, 错误: {}",
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
impl<T: Send + Sync + 'static> TransferWorker for UploadWorker<T> {
    fn tag(&self) -> String {
        self.info.lock().unwrap().task.tag.clone()
    }

    fn state(&self) -> TaskState {
        UploadWorker::state(self)
    }

    fn cancel(&self) {
        UploadWorker::cancel(self);
    }

    async fn wait(&self) -> TaskState {
        UploadWorker::wait(self).await
    }
}
