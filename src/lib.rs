//! 一个简单的网络传输任务库。
//!
//! 把一次上传或下载建模成有生命周期、可取消、可观察的任务：
//! 状态机 `Waiting -> Active -> Completed | Error | Cancelled`，
//! 进度按字节去重归一后上报，取消是协作式的，终态回调每个任务
//! 恰好一次。具体的 HTTP 收发交给可替换的 [`transport::Transport`]，
//! 响应解码交给可替换的 [`converter::ResponseConverter`]。
//!
//! 入口是 [`facade::EasyHttp`]，多任务并发走
//! [`coordinator::MultiTransferCoordinator`]，两者共享一个
//! [`pool::WorkerPool`]。

pub mod converter;
pub mod coordinator;
pub mod error;
pub mod facade;
pub mod listener;
pub mod pool;
pub mod progress;
pub mod task;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use converter::{
    ConvertedResponse, JsonResponseConverter, OriginalResponseConverter, ResponseConverter,
    StringResponseConverter,
};
pub use coordinator::MultiTransferCoordinator;
pub use error::{ConvertError, TransferError, TransportError};
pub use facade::{EasyHttp, EasyHttpBuilder, RequestHandle};
pub use listener::{
    DownloadListener, MultiDownloadListener, MultiUploadListener, ProgressListener,
    RequestCallback, UploadListener,
};
pub use pool::WorkerPool;
pub use progress::{ByteCount, ProgressTracker};
pub use task::{DownloadInfo, FilePart, TaskInfo, TaskState, UploadInfo};
pub use transport::{
    ByteStream, HttpTransport, RawResponse, RequestBody, RequestDescriptor, ResponseMeta,
    Transport, WriteProgress,
};
pub use worker::{DownloadWorker, TaskOutcome, TransferWorker, UploadWorker};
