use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::Either;
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{
    RawResponse, RequestBody, RequestDescriptor, ResponseMeta, Transport, WriteProgress,
};

const USER_AGENT: &str = concat!("easy-transfer/", env!("CARGO_PKG_VERSION"));

/// 基于 reqwest 的默认传输实现
#[derive(Debug, Clone)]
pub struct HttpTransport {
    inner: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { inner: client })
    }

    /// 使用自定义的 reqwest 客户端（超时、代理、TLS 等自行配置）
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { inner: client }
    }

    async fn build_request(
        &self,
        request: RequestDescriptor,
        write_progress: Option<WriteProgress>,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        let RequestDescriptor {
            method,
            url,
            headers,
            body,
        } = request;
        let builder = self.inner.request(method, &url).headers(headers);
        let builder = match body {
            RequestBody::None => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(params) => builder.form(&params),
            RequestBody::Raw(data) => builder.body(data),
            RequestBody::Multipart { params, files } => {
                let mut form = reqwest::multipart::Form::new();
                for (name, value) in params {
                    form = form.text(name, value);
                }
                for part in files {
                    let meta = tokio::fs::metadata(&part.path).await?;
                    let total = meta.len();
                    let file = tokio::fs::File::open(&part.path).await?;
                    let file_name = part
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| part.name.clone());
                    let stream = ReaderStream::new(file);
                    // 每个文件分部独立累计写进度，以分部名上报
                    let stream = match &write_progress {
                        Some(hook) => {
                            let hook = Arc::clone(hook);
                            let name = part.name.clone();
                            let sent = AtomicU64::new(0);
                            Either::Left(stream.inspect(move |chunk| {
                                if let Ok(bytes) = chunk {
                                    let cum = sent.fetch_add(bytes.len() as u64, Ordering::SeqCst)
                                        + bytes.len() as u64;
                                    hook(&name, cum, Some(total));
                                }
                            }))
                        }
                        None => Either::Right(stream),
                    };
                    let form_part =
                        reqwest::multipart::Part::stream_with_length(
                            reqwest::Body::wrap_stream(stream),
                            total,
                        )
                        .file_name(urlencoding::encode(&file_name).into_owned())
                        .mime_str("application/octet-stream")?;
                    form = form.part(part.name, form_part);
                }
                builder.multipart(form)
            }
        };
        Ok(builder)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: RequestDescriptor,
        write_progress: Option<WriteProgress>,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportError> {
        debug!("发起请求: {} {}", request.method, request.url);
        let builder = self.build_request(request, write_progress).await?;
        let response = tokio::select! {
            resp = builder.send() => resp?,
            _ = cancel.cancelled() => return Err(TransportError::Aborted),
        };
        debug!("响应状态: {}", response.status());
        let meta = ResponseMeta {
            status: response.status().as_u16(),
            headers: response.headers().clone(),
        };
        let body = response.bytes_stream().map_err(TransportError::Http);
        Ok(RawResponse {
            meta,
            body: Box::pin(body),
        })
    }
}
