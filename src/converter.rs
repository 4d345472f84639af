use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::{ConvertError, TransferError};
use crate::transport::ResponseMeta;

/// 响应体转换器：把原始响应体转换成业务类型。
///
/// 响应体按值传入、单遍消费，和传输层只读一次的流语义一致；
/// 空响应体也必须能安全处理（可以失败，不能 panic）。
pub trait ResponseConverter: Send + Sync {
    type Output;

    fn convert(&self, body: Bytes) -> Result<Self::Output, ConvertError>;
}

/// 不做转换，原样返回响应体字节
#[derive(Debug, Default)]
pub struct OriginalResponseConverter;

impl ResponseConverter for OriginalResponseConverter {
    type Output = Bytes;

    fn convert(&self, body: Bytes) -> Result<Bytes, ConvertError> {
        Ok(body)
    }
}

/// 响应体按 UTF-8 解码为字符串
#[derive(Debug, Default)]
pub struct StringResponseConverter;

impl ResponseConverter for StringResponseConverter {
    type Output = String;

    fn convert(&self, body: Bytes) -> Result<String, ConvertError> {
        Ok(String::from_utf8(body.to_vec())?)
    }
}

/// 响应体为 JSON 字符串，反序列化成目标类型
#[derive(Debug)]
pub struct JsonResponseConverter<T> {
    _marker: PhantomData<T>,
}

impl<T> JsonResponseConverter<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonResponseConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResponseConverter for JsonResponseConverter<T>
where
    T: DeserializeOwned + Send + Sync,
{
    type Output = T;

    fn convert(&self, body: Bytes) -> Result<T, ConvertError> {
        Ok(serde_json::from_slice(&body)?)
    }
}

// --------------------------------------------------------------------
/// 转换过的响应数据。
///
/// 原始响应是 2xx 且配置了转换器时，`converted_body` 和
/// `convert_error` 恰好有一个存在；原始响应本身失败（非 2xx）时
/// 两者都为空，以原始状态码为准。传输失败和取消记在 `error` 里，
/// 同步调用被取消时 `error` 一定被填充，不会留下空结果。
#[derive(Debug)]
pub struct ConvertedResponse<T> {
    /// 原始响应元数据；传输失败时为 None
    pub response: Option<ResponseMeta>,
    /// 转换后的结果
    pub converted_body: Option<T>,
    /// 转换异常
    pub convert_error: Option<Arc<ConvertError>>,
    /// 传输失败或取消
    pub error: Option<Arc<TransferError>>,
}

impl<T> ConvertedResponse<T> {
    pub(crate) fn empty() -> Self {
        Self {
            response: None,
            converted_body: None,
            convert_error: None,
            error: None,
        }
    }

    pub(crate) fn with_meta(meta: ResponseMeta) -> Self {
        Self {
            response: Some(meta),
            converted_body: None,
            convert_error: None,
            error: None,
        }
    }

    /// 原始响应存在且是 2xx
    pub fn is_successful(&self) -> bool {
        self.response.as_ref().is_some_and(ResponseMeta::is_successful)
    }

    /// 是否因取消而结束
    pub fn is_cancelled(&self) -> bool {
        self.error.as_deref().is_some_and(TransferError::is_cancelled)
    }
}

impl<T> Default for ConvertedResponse<T> {
    fn default() -> Self {
        Self::empty()
    }
}
