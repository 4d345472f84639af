use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::task::FilePart;

pub mod http;

pub use http::HttpTransport;

/// 请求体写进度回调：(分部名, 该分部累计已写字节, 分部总量)
pub type WriteProgress = Arc<dyn Fn(&str, u64, Option<u64>) + Send + Sync>;

/// 请求描述：URL、方法、头和载荷，不关心具体传输实现
#[derive(Debug)]
pub struct RequestDescriptor {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: reqwest::header::HeaderMap,
    pub body: RequestBody,
}

#[derive(Debug)]
pub enum RequestBody {
    None,
    Json(serde_json::Value),
    Form(HashMap<String, String>),
    Raw(Bytes),
    /// multipart 表单：普通参数加文件分部（上传用）
    Multipart {
        params: HashMap<String, String>,
        files: Vec<FilePart>,
    },
}

impl RequestDescriptor {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::GET,
            url: url.into(),
            headers: reqwest::header::HeaderMap::new(),
            body: RequestBody::None,
        }
    }

    pub fn post(url: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method: reqwest::Method::POST,
            url: url.into(),
            headers: reqwest::header::HeaderMap::new(),
            body,
        }
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::DELETE,
            url: url.into(),
            headers: reqwest::header::HeaderMap::new(),
            body: RequestBody::None,
        }
    }
}

/// 原始响应元数据
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
}

impl ResponseMeta {
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// 原始响应：元数据加响应体字节流，流只能消费一次
pub struct RawResponse {
    pub meta: ResponseMeta,
    pub body: ByteStream,
}

impl RawResponse {
    /// 把响应体整个读进内存
    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// 传输能力。
///
/// 给定请求描述，返回原始响应（状态、头、字节流）或传输层错误；
/// 请求体写进度通过 `write_progress` 上报，取消通过 token 协作：
/// 实现必须在 token 取消时中止在途调用并返回 `Aborted`。
/// 超时由具体实现自己配置，超时和其他传输失败同样对待。
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: RequestDescriptor,
        write_progress: Option<WriteProgress>,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportError>;
}
