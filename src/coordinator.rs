use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::converter::ResponseConverter;
use crate::error::{ConvertError, TransferError};
use crate::listener::{
    DownloadListener, MultiDownloadListener, MultiUploadListener, ProgressListener, UploadListener,
};
use crate::pool::WorkerPool;
use crate::task::{DownloadInfo, TaskInfo, UploadInfo};
use crate::transport::{ResponseMeta, Transport};
use crate::worker::{DownloadWorker, TransferWorker, UploadWorker};

/// 多任务协调器。
///
/// 把一批任务展开成共享同一个监听器的 worker 集合：单任务回调
/// 按 tag 区分，整体完成信号在该批所有任务到达终态后恰好发出一次，
/// 成功、失败、取消都算完成，不会因为单个失败而短路。
/// 不同任务的回调之间没有顺序保证。
pub struct MultiTransferCoordinator {
    pool: Arc<WorkerPool>,
    transport: Arc<dyn Transport>,
    workers: DashMap<String, Arc<dyn TransferWorker>>,
}

impl MultiTransferCoordinator {
    pub fn new(pool: Arc<WorkerPool>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            transport,
            workers: DashMap::new(),
        })
    }

    /// 提交一批下载任务并全部启动，返回各任务的 tag。
    ///
    /// 整批先校验（tag 唯一、URL 合法），有任何配置错误时
    /// 一个任务都不会启动。
    pub fn submit_downloads(
        &self,
        infos: Vec<DownloadInfo>,
        listener: Arc<dyn MultiDownloadListener>,
    ) -> Result<Vec<String>, TransferError> {
        self.check_tags(infos.iter().map(|i| &i.task.tag), infos.len())?;
        let shared = Arc::new(AggregateDownloadListener {
            inner: listener,
            remaining: AtomicUsize::new(infos.len()),
        });
        let mut workers = Vec::with_capacity(infos.len());
        for info in infos {
            let tag = info.task.tag.clone();
            let worker = DownloadWorker::new(
                info,
                Some(Arc::clone(&shared) as Arc<dyn DownloadListener>),
                Arc::clone(&self.transport),
                Arc::clone(&self.pool),
            )?;
            workers.push((tag, worker));
        }
        info!("提交 {} 个下载任务", workers.len());
        let mut tags = Vec::with_capacity(workers.len());
        for (tag, worker) in workers {
            self.workers
                .insert(tag.clone(), Arc::clone(&worker) as Arc<dyn TransferWorker>);
            worker.start();
            tags.push(tag);
        }
        Ok(tags)
    }

    /// 提交一批上传任务并全部启动，所有任务共用同一个转换器。
    pub fn submit_uploads<T: Send + Sync + 'static>(
        &self,
        infos: Vec<UploadInfo>,
        converter: Option<Arc<dyn ResponseConverter<Output = T>>>,
        listener: Arc<dyn MultiUploadListener<T>>,
    ) -> Result<Vec<String>, TransferError> {
        self.check_tags(infos.iter().map(|i| &i.task.tag), infos.len())?;
        let shared = Arc::new(AggregateUploadListener {
            inner: listener,
            remaining: AtomicUsize::new(infos.len()),
        });
        let mut workers = Vec::with_capacity(infos.len());
        for info in infos {
            let tag = info.task.tag.clone();
            let worker = UploadWorker::new(
                info,
                converter.clone(),
                Some(Arc::clone(&shared) as Arc<dyn UploadListener<T>>),
                Arc::clone(&self.transport),
                Arc::clone(&self.pool),
            )?;
            workers.push((tag, worker));
        }
        info!("提交 {} 个上传任务", workers.len());
        let mut tags = Vec::with_capacity(workers.len());
        for (tag, worker) in workers {
            self.workers
                .insert(tag.clone(), Arc::clone(&worker) as Arc<dyn TransferWorker>);
            worker.start();
            tags.push(tag);
        }
        Ok(tags)
    }

    /// 按 tag 查 worker
    pub fn worker(&self, tag: &str) -> Option<Arc<dyn TransferWorker>> {
        self.workers.get(tag).map(|w| Arc::clone(w.value()))
    }

    /// 请求取消所有未到终态的任务；已到终态的不受影响
    pub fn cancel_all(&self) {
        debug!("取消所有在途任务");
        for entry in self.workers.iter() {
            entry.value().cancel();
        }
    }

    /// 等所有已提交的任务到达终态
    pub async fn wait_all(&self) {
        let workers: Vec<Arc<dyn TransferWorker>> = self
            .workers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for worker in workers {
            worker.wait().await;
        }
    }

    // tag 在同批内和在途任务间都必须唯一；已终结的任务允许同 tag 重新提交
    fn check_tags<'a>(
        &self,
        tags: impl Iterator<Item = &'a String>,
        count: usize,
    ) -> Result<(), TransferError> {
        if count == 0 {
            return Err(TransferError::Configuration("任务列表为空".to_string()));
        }
        let mut seen = HashSet::new();
        for tag in tags {
            if !seen.insert(tag.clone()) {
                return Err(TransferError::Configuration(format!("任务标识重复: {}", tag)));
            }
            if let Some(existing) = self.workers.get(tag) {
                if !existing.value().is_disposed() {
                    return Err(TransferError::Configuration(format!(
                        "任务标识已被在途任务占用: {}",
                        tag
                    )));
                }
            }
        }
        Ok(())
    }
}

// 包装共享监听器：转发单任务回调，并维护整批的完成计数
struct AggregateDownloadListener {
    inner: Arc<dyn MultiDownloadListener>,
    remaining: AtomicUsize,
}

impl ProgressListener for AggregateDownloadListener {
    fn on_progress(&self, name: &str, current: u64, total: Option<u64>) {
        self.inner.on_progress(name, current, total);
    }
}

impl DownloadListener for AggregateDownloadListener {
    fn on_state_change(&self, info: &TaskInfo, error: Option<&TransferError>) {
        self.inner.on_state_change(info, error);
        // 每个任务恰好一次终态回调，计数归零时整体完成信号恰好发出一次
        if info.state.is_terminal() && self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.on_all_complete();
        }
    }
}

struct AggregateUploadListener<T> {
    inner: Arc<dyn MultiUploadListener<T>>,
    remaining: AtomicUsize,
}

impl<T> ProgressListener for AggregateUploadListener<T>
where
    T: Send + Sync,
{
    fn on_progress(&self, name: &str, current: u64, total: Option<u64>) {
        self.inner.on_progress(name, current, total);
    }
}

impl<T> UploadListener<T> for AggregateUploadListener<T>
where
    T: Send + Sync,
{
    fn on_state_change(&self, info: &TaskInfo, error: Option<&TransferError>) {
        self.inner.on_state_change(info, error);
        if info.state.is_terminal() && self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.on_all_complete();
        }
    }

    fn on_response(&self, response: &ResponseMeta, converted: Option<&T>) {
        self.inner.on_response(response, converted);
    }

    fn on_convert_error(&self, error: &ConvertError) {
        self.inner.on_convert_error(error);
    }
}
