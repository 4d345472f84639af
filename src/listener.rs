use crate::error::{ConvertError, TransferError};
use crate::task::TaskInfo;
use crate::transport::ResponseMeta;

/// 最小进度能力，组合进各个更丰富的监听器契约。
///
/// `name` 在多文件上传时是分部名，下载时是任务 tag。
/// 回调在任务池的执行上下文里发出，可能与调用方控制流并发，
/// 监听器实现不要阻塞。
pub trait ProgressListener: Send + Sync {
    /// 进度更新
    ///
    /// * `current` - 已完成的大小
    /// * `total` - 总大小，未知时为 None
    fn on_progress(&self, name: &str, current: u64, total: Option<u64>);
}

/// 下载监听
pub trait DownloadListener: ProgressListener {
    /// 任务状态改变；`error` 仅在 Error 终态时携带原因
    fn on_state_change(&self, info: &TaskInfo, error: Option<&TransferError>);
}

/// 多任务下载监听器：按 tag 区分单任务回调，外加一次整体完成信号
pub trait MultiDownloadListener: DownloadListener {
    /// 所有任务到达终态（成功、失败、取消都算）后回调一次
    fn on_all_complete(&self);
}

/// 上传监听
pub trait UploadListener<T>: ProgressListener {
    /// 任务状态改变；`error` 仅在 Error 终态时携带原因
    fn on_state_change(&self, info: &TaskInfo, error: Option<&TransferError>);

    /// 响应结果
    ///
    /// * `response` - 原始响应元数据
    /// * `converted` - 经过转换器转换后的结果，未配置转换器或非 2xx 时为 None
    fn on_response(&self, response: &ResponseMeta, converted: Option<&T>);

    /// 转换错误
    fn on_convert_error(&self, _error: &ConvertError) {}
}

/// 多任务上传监听器
pub trait MultiUploadListener<T>: UploadListener<T> {
    /// 所有任务到达终态后回调一次
    fn on_all_complete(&self);
}

/// 普通请求的结果回调，无任务语义。
///
/// 非 2xx 响应也走 `on_success`，此时 `converted` 为 None，
/// 以原始状态码为准；`on_error` 只表示传输失败、转换失败或取消。
pub trait RequestCallback<T>: Send + Sync {
    fn on_success(&self, response: &ResponseMeta, converted: Option<T>);

    fn on_error(&self, error: TransferError);
}
