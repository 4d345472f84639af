use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::converter::{ConvertedResponse, ResponseConverter};
use crate::coordinator::MultiTransferCoordinator;
use crate::error::TransferError;
use crate::listener::{
    DownloadListener, ProgressListener, RequestCallback, UploadListener,
};
use crate::pool::WorkerPool;
use crate::task::{DownloadInfo, TaskInfo, UploadInfo};
use crate::transport::{
    HttpTransport, RequestBody, RequestDescriptor, ResponseMeta, Transport,
};
use crate::worker::{DownloadWorker, TaskOutcome, UploadWorker};

/// http 网络请求入口，包含普通的 get 和 post、上传、下载。
///
/// 持有工作池和传输实现，由装配方创建并负责关闭；
/// 异步调用不阻塞提交方，同步变体在当前任务内执行到底。
pub struct EasyHttp {
    pool: Arc<WorkerPool>,
    transport: Arc<dyn Transport>,
    coordinator: Arc<MultiTransferCoordinator>,
}

pub struct EasyHttpBuilder {
    parallelism: Option<usize>,
    transport: Option<Arc<dyn Transport>>,
}

impl EasyHttpBuilder {
    /// 工作池并发数，不设置时取可用核数
    pub fn parallelism(mut self, permits: usize) -> Self {
        self.parallelism = Some(permits);
        self
    }

    /// 自定义传输实现，不设置时使用默认的 reqwest 客户端
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<EasyHttp, TransferError> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new()?),
        };
        let pool = match self.parallelism {
            Some(n) => WorkerPool::new(n),
            None => WorkerPool::with_default_parallelism(),
        };
        let coordinator =
            MultiTransferCoordinator::new(Arc::clone(&pool), Arc::clone(&transport));
        Ok(EasyHttp {
            pool,
            transport,
            coordinator,
        })
    }
}

impl EasyHttp {
    pub fn new() -> Result<Self, TransferError> {
        Self::builder().build()
    }

    pub fn builder() -> EasyHttpBuilder {
        EasyHttpBuilder {
            parallelism: None,
            transport: None,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// 多任务协调器
    pub fn coordinator(&self) -> Arc<MultiTransferCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// 关闭：取消所有在途任务并等它们回到终态
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    // ---------------- 下载 ----------------

    /// 单文件下载，异步的
    pub fn download(
        &self,
        info: DownloadInfo,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> Result<Arc<DownloadWorker>, TransferError> {
        let worker = DownloadWorker::new(
            info,
            listener,
            Arc::clone(&self.transport),
            Arc::clone(&self.pool),
        )?;
        worker.start();
        Ok(worker)
    }

    /// 单文件下载，同步的：在当前任务内执行到终态
    pub async fn download_sync(
        &self,
        info: DownloadInfo,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Result<TaskOutcome, TransferError> {
        let listener = progress.map(|p| Arc::new(ProgressOnly(p)) as Arc<dyn DownloadListener>);
        let worker = DownloadWorker::new(
            info,
            listener,
            Arc::clone(&self.transport),
            Arc::clone(&self.pool),
        )?;
        Ok(worker.run_sync().await)
    }

    // ---------------- 上传 ----------------

    /// 上传，异步的
    pub fn upload<T: Send + Sync + 'static>(
        &self,
        info: UploadInfo,
        converter: Option<Arc<dyn ResponseConverter<Output = T>>>,
        listener: Option<Arc<dyn UploadListener<T>>>,
    ) -> Result<Arc<UploadWorker<T>>, TransferError> {
        let worker = UploadWorker::new(
            info,
            converter,
            listener,
            Arc::clone(&self.transport),
            Arc::clone(&self.pool),
        )?;
        worker.start();
        Ok(worker)
    }

    /// 上传，同步的
    pub async fn upload_sync<T: Send + Sync + 'static>(
        &self,
        info: UploadInfo,
        converter: Option<Arc<dyn ResponseConverter<Output = T>>>,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> Result<ConvertedResponse<T>, TransferError> {
        let listener = progress.map(|p| Arc::new(ProgressOnly(p)) as Arc<dyn UploadListener<T>>);
        let worker = UploadWorker::new(
            info,
            converter,
            listener,
            Arc::clone(&self.transport),
            Arc::clone(&self.pool),
        )?;
        Ok(worker.run_sync().await)
    }

    // ---------------- 普通请求 ----------------

    /// 普通 GET 请求，异步的
    pub fn get<T: Send + Sync + 'static>(
        &self,
        url: &str,
        converter: Arc<dyn ResponseConverter<Output = T>>,
        callback: Arc<dyn RequestCallback<T>>,
    ) -> Result<RequestHandle, TransferError> {
        self.dispatch(RequestDescriptor::get(url), converter, callback)
    }

    /// POST 请求，body 是 json，异步的
    pub fn post_json<T: Send + Sync + 'static>(
        &self,
        url: &str,
        json: serde_json::Value,
        converter: Arc<dyn ResponseConverter<Output = T>>,
        callback: Arc<dyn RequestCallback<T>>,
    ) -> Result<RequestHandle, TransferError> {
        self.dispatch(
            RequestDescriptor::post(url, RequestBody::Json(json)),
            converter,
            callback,
        )
    }

    /// POST 请求，body 是表单，异步的
    pub fn post_form<T: Send + Sync + 'static>(
        &self,
        url: &str,
        params: HashMap<String, String>,
        converter: Arc<dyn ResponseConverter<Output = T>>,
        callback: Arc<dyn RequestCallback<T>>,
    ) -> Result<RequestHandle, TransferError> {
        self.dispatch(
            RequestDescriptor::post(url, RequestBody::Form(params)),
            converter,
            callback,
        )
    }

    /// DELETE 请求，异步的
    pub fn delete<T: Send + Sync + 'static>(
        &self,
        url: &str,
        converter: Arc<dyn ResponseConverter<Output = T>>,
        callback: Arc<dyn RequestCallback<T>>,
    ) -> Result<RequestHandle, TransferError> {
        self.dispatch(RequestDescriptor::delete(url), converter, callback)
    }

    /// 普通 GET 请求，同步的
    pub async fn get_sync<T: Send + Sync + 'static>(
        &self,
        url: &str,
        converter: Arc<dyn ResponseConverter<Output = T>>,
    ) -> Result<ConvertedResponse<T>, TransferError> {
        self.request_sync(RequestDescriptor::get(url), converter).await
    }

    /// POST 请求，body 是 json，同步的
    pub async fn post_json_sync<T: Send + Sync + 'static>(
        &self,
        url: &str,
        json: serde_json::Value,
        converter: Arc<dyn ResponseConverter<Output = T>>,
    ) -> Result<ConvertedResponse<T>, TransferError> {
        self.request_sync(RequestDescriptor::post(url, RequestBody::Json(json)), converter)
            .await
    }

    /// POST 请求，body 是表单，同步的
    pub async fn post_form_sync<T: Send + Sync + 'static>(
        &self,
        url: &str,
        params: HashMap<String, String>,
        converter: Arc<dyn ResponseConverter<Output = T>>,
    ) -> Result<ConvertedResponse<T>, TransferError> {
        self.request_sync(RequestDescriptor::post(url, RequestBody::Form(params)), converter)
            .await
    }

    /// DELETE 请求，同步的
    pub async fn delete_sync<T: Send + Sync + 'static>(
        &self,
        url: &str,
        converter: Arc<dyn ResponseConverter<Output = T>>,
    ) -> Result<ConvertedResponse<T>, TransferError> {
        self.request_sync(RequestDescriptor::delete(url), converter).await
    }

    fn dispatch<T: Send + Sync + 'static>(
        &self,
        descriptor: RequestDescriptor,
        converter: Arc<dyn ResponseConverter<Output = T>>,
        callback: Arc<dyn RequestCallback<T>>,
    ) -> Result<RequestHandle, TransferError> {
        Self::check_url(&descriptor.url)?;
        let cancel = self.pool.child_token();
        let transport = Arc::clone(&self.transport);
        let pool = Arc::clone(&self.pool);
        let token = cancel.clone();
        let cb = Arc::clone(&callback);
        debug!("派发请求: {} {}", descriptor.method, descriptor.url);
        let spawned = self.pool.spawn(async move {
            let permit = tokio::select! {
                permit = pool.acquire() => permit,
                _ = token.cancelled() => None,
            };
            if permit.is_none() {
                cb.on_error(TransferError::Cancelled);
                return;
            }
            match Self::perform(transport, descriptor, converter, &token).await {
                Ok((meta, body)) => cb.on_success(&meta, body),
                Err(err) => cb.on_error(err),
            }
        });
        if !spawned {
            // 池已关闭，回调依然要有终结通知
            callback.on_error(TransferError::Cancelled);
        }
        Ok(RequestHandle { cancel })
    }

    async fn perform<T: Send + Sync + 'static>(
        transport: Arc<dyn Transport>,
        descriptor: RequestDescriptor,
        converter: Arc<dyn ResponseConverter<Output = T>>,
        cancel: &CancellationToken,
    ) -> Result<(ResponseMeta, Option<T>), TransferError> {
        // 取消期间传输层返回的错误一律归为取消，让调用方能区分"失败"和"主动停止"
        let response = tokio::select! {
            resp = transport.execute(descriptor, None, cancel) => match resp {
                Ok(resp) => resp,
                Err(_) if cancel.is_cancelled() => return Err(TransferError::Cancelled),
                Err(err) => return Err(err.into()),
            },
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        let meta = response.meta.clone();
        let body = tokio::select! {
            body = response.bytes() => match body {
                Ok(body) => body,
                Err(_) if cancel.is_cancelled() => return Err(TransferError::Cancelled),
                Err(err) => return Err(TransferError::Transport(err)),
            },
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        if meta.is_successful() {
            let value = converter.convert(body)?;
            Ok((meta, Some(value)))
        } else {
            // 非 2xx 也走 on_success，以原始状态码为准
            Ok((meta, None))
        }
    }

    async fn request_sync<T: Send + Sync + 'static>(
        &self,
        descriptor: RequestDescriptor,
        converter: Arc<dyn ResponseConverter<Output = T>>,
    ) -> Result<ConvertedResponse<T>, TransferError> {
        Self::check_url(&descriptor.url)?;
        let cancel = CancellationToken::new();
        let response = match self.transport.execute(descriptor, None, &cancel).await {
            Ok(resp) => resp,
            Err(err) => {
                let mut resp = ConvertedResponse::empty();
                resp.error = Some(Arc::new(TransferError::Transport(err)));
                return Ok(resp);
            }
        };
        let meta = response.meta.clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                let mut resp = ConvertedResponse::with_meta(meta);
                resp.error = Some(Arc::new(TransferError::Transport(err)));
                return Ok(resp);
            }
        };
        let mut resp = ConvertedResponse::with_meta(meta.clone());
        if meta.is_successful() {
            match converter.convert(body) {
                Ok(value) => resp.converted_body = Some(value),
                Err(err) => resp.convert_error = Some(Arc::new(err)),
            }
        }
        Ok(resp)
    }

    fn check_url(url: &str) -> Result<(), TransferError> {
        url::Url::parse(url)
            .map(|_| ())
            .map_err(|e| TransferError::Configuration(format!("无效的请求地址 {}: {}", url, e)))
    }
}

/// 取消在途普通请求的句柄
#[derive(Debug, Clone)]
pub struct RequestHandle {
    cancel: CancellationToken,
}

impl RequestHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// 只关心进度的同步调用适配：状态回调留空
struct ProgressOnly(Arc<dyn ProgressListener>);

impl ProgressListener for ProgressOnly {
    fn on_progress(&self, name: &str, current: u64, total: Option<u64>) {
        self.0.on_progress(name, current, total);
    }
}

impl DownloadListener for ProgressOnly {
    fn on_state_change(&self, _info: &TaskInfo, _error: Option<&TransferError>) {}
}

impl<T> UploadListener<T> for ProgressOnly {
    fn on_state_change(&self, _info: &TaskInfo, _error: Option<&TransferError>) {}

    fn on_response(&self, _response: &ResponseMeta, _converted: Option<&T>) {}
}
