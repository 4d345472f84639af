use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransferError;
use crate::task::{TaskInfo, TaskState};

pub mod download;
pub mod upload;

pub use download::DownloadWorker;
pub use upload::UploadWorker;

/// 一次任务的最终结果（同步变体的返回值）。
///
/// 被取消时 `error` 一定是 `Cancelled`，不会留下空结果让调用方猜。
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// 终态快照
    pub info: TaskInfo,
    pub error: Option<Arc<TransferError>>,
}

impl TaskOutcome {
    pub fn is_successful(&self) -> bool {
        self.info.state == TaskState::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.info.state == TaskState::Cancelled
    }
}

/// 单个传输任务的公共操作，上传和下载 worker 都实现它。
///
/// 协调器经由这个 trait 统一持有两类 worker。
#[async_trait]
pub trait TransferWorker: Send + Sync {
    fn tag(&self) -> String;

    fn state(&self) -> TaskState;

    /// 请求中止：尽力打断在途传输并走到取消终态；
    /// 已经是终态时是 no-op，不报错、不阻塞
    fn cancel(&self);

    fn is_active(&self) -> bool {
        self.state() == TaskState::Active
    }

    fn is_disposed(&self) -> bool {
        self.state().is_terminal()
    }

    /// 等任务到达终态
    async fn wait(&self) -> TaskState;
}
