use std::sync::Arc;

use thiserror::Error;

// 传输层错误：连接、超时、IO、非 2xx 状态
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("网络请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP 状态异常: {0}")]
    Status(u16),

    #[error("请求已中止")]
    Aborted,
}

// 响应体转换错误
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("JSON 解析失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error("文本解码失败: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("转换失败: {0}")]
    Other(String),
}

/// 任务级错误。
///
/// `Transport` 和 `Convert` 只通过 ERROR 终态和监听器回调暴露，
/// 不会作为未捕获异常泄漏到任务线程之外；`Cancelled` 单独成类，
/// 调用方由此区分"失败"和"主动停止"；`Configuration` 在提交时
/// 直接返回给调用方，不产生任何状态迁移。
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("传输失败: {0}")]
    Transport(#[from] TransportError),

    #[error("响应转换失败: {0}")]
    Convert(Arc<ConvertError>),

    #[error("任务已取消")]
    Cancelled,

    #[error("配置错误: {0}")]
    Configuration(String),
}

impl From<ConvertError> for TransferError {
    fn from(e: ConvertError) -> Self {
        Self::Convert(Arc::new(e))
    }
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
