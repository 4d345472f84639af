use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// 进程内共享的工作池。
///
/// 以信号量限制同时在途的传输数，默认并发数取可用核数；
/// 所有异步任务都落在这里执行，由装配方显式持有、显式关闭，
/// 不做隐式全局状态。
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    permits: usize,
}

impl WorkerPool {
    pub fn new(permits: usize) -> Arc<Self> {
        let permits = permits.max(1);
        debug!("创建工作池, 并发数: {}", permits);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            permits,
        })
    }

    /// 并发数取可用处理器数
    pub fn with_default_parallelism() -> Arc<Self> {
        let permits = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(permits)
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    /// 池级取消令牌的子令牌；池关闭时所有子令牌一并取消，
    /// 在途任务由此走到取消终态而不是悄悄消失
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // 池已关闭时拒绝新任务，返回 false
    pub(crate) fn spawn<F>(&self, fut: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.tracker.spawn(fut);
        true
    }

    // 排队等一个执行许可；池关闭后返回 None
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).acquire_owned().await.ok()
    }

    /// 关闭并排空：取消所有在途任务，等它们全部回到终态
    pub async fn shutdown(&self) {
        info!("关闭工作池");
        self.shutdown.cancel();
        self.semaphore.close();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
