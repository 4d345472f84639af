//! 测试共用的脚本化传输和记录型监听器

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::error::{ConvertError, TransferError, TransportError};
use crate::listener::{
    DownloadListener, MultiDownloadListener, MultiUploadListener, ProgressListener,
    RequestCallback, UploadListener,
};
use crate::task::{TaskInfo, TaskState};
use crate::transport::{
    RawResponse, RequestBody, RequestDescriptor, ResponseMeta, Transport, WriteProgress,
};

/// 测试里打开日志输出，重复调用无害
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// 一个 URL 对应的脚本行为
#[derive(Debug, Clone)]
pub(crate) enum Stage {
    Ok {
        status: u16,
        chunks: Vec<Bytes>,
        content_length: bool,
    },
    /// 连接层直接失败
    FailConnect,
    /// 先给一段数据，然后流中断
    FailMidStream { first: Bytes },
    /// 挂起直到被取消
    Hang,
}

/// 按 URL 脚本化响应的传输实现，并统计调用次数
pub(crate) struct ScriptedTransport {
    routes: Mutex<HashMap<String, Stage>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn route(&self, url: &str, stage: Stage) {
        self.routes.lock().unwrap().insert(url.to_string(), stage);
    }

    pub fn route_ok(&self, url: &str, status: u16, chunks: Vec<Bytes>, content_length: bool) {
        self.route(
            url,
            Stage::Ok {
                status,
                chunks,
                content_length,
            },
        );
    }

    /// execute 被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        request: RequestDescriptor,
        write_progress: Option<WriteProgress>,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stage = self
            .routes
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or(Stage::Ok {
                status: 200,
                chunks: vec![],
                content_length: false,
            });
        match stage {
            Stage::Hang => {
                cancel.cancelled().await;
                Err(TransportError::Aborted)
            }
            Stage::FailConnect => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "连接被拒绝",
            ))),
            Stage::FailMidStream { first } => {
                let items: Vec<Result<Bytes, TransportError>> = vec![
                    Ok(first),
                    Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "流中断",
                    ))),
                ];
                Ok(RawResponse {
                    meta: ResponseMeta {
                        status: 200,
                        headers: HeaderMap::new(),
                    },
                    body: Box::pin(stream::iter(items)),
                })
            }
            Stage::Ok {
                status,
                chunks,
                content_length,
            } => {
                // 模拟上传的写进度：每个文件分部按真实大小上报两次
                if let (RequestBody::Multipart { files, .. }, Some(hook)) =
                    (&request.body, &write_progress)
                {
                    for part in files {
                        if let Ok(meta) = std::fs::metadata(&part.path) {
                            let len = meta.len();
                            if len > 1 {
                                hook(&part.name, len / 2, Some(len));
                            }
                            hook(&part.name, len, Some(len));
                        }
                    }
                }
                let mut headers = HeaderMap::new();
                if content_length {
                    let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
                }
                let items: Vec<Result<Bytes, TransportError>> =
                    chunks.into_iter().map(Ok).collect();
                Ok(RawResponse {
                    meta: ResponseMeta { status, headers },
                    body: Box::pin(stream::iter(items)),
                })
            }
        }
    }
}

// --------------------------------------------------------------------
#[derive(Debug, Clone)]
pub(crate) enum Event {
    State {
        tag: String,
        state: TaskState,
        has_error: bool,
    },
    Progress {
        name: String,
        current: u64,
        total: Option<u64>,
    },
    Response {
        status: u16,
        converted: bool,
    },
    ConvertError,
    AllComplete,
}

/// 把所有回调按发生顺序记下来的监听器
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// 某个任务的状态回调序列
    pub fn states_of(&self, tag: &str) -> Vec<TaskState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::State { tag: t, state, .. } if t == tag => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn terminal_of(&self, tag: &str) -> Option<TaskState> {
        self.states_of(tag).into_iter().find(|s| s.is_terminal())
    }

    /// Error 终态回调是否带了原因
    pub fn error_of(&self, tag: &str) -> bool {
        self.events().into_iter().any(|e| {
            matches!(e, Event::State { tag: t, state: TaskState::Error, has_error: true } if t == tag)
        })
    }

    /// 某个分部名的进度回调序列
    pub fn progress_of(&self, name: &str) -> Vec<(u64, Option<u64>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Progress { name: n, current, total } if n == name => Some((current, total)),
                _ => None,
            })
            .collect()
    }

    pub fn all_complete_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::AllComplete))
            .count()
    }

    /// 上传响应回调序列: (状态码, 是否带转换结果)
    pub fn responses(&self) -> Vec<(u16, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Response { status, converted } => Some((status, converted)),
                _ => None,
            })
            .collect()
    }

    pub fn response_count(&self) -> usize {
        self.responses().len()
    }

    pub fn convert_error_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::ConvertError))
            .count()
    }
}

impl ProgressListener for RecordingListener {
    fn on_progress(&self, name: &str, current: u64, total: Option<u64>) {
        self.push(Event::Progress {
            name: name.to_string(),
            current,
            total,
        });
    }
}

impl DownloadListener for RecordingListener {
    fn on_state_change(&self, info: &TaskInfo, error: Option<&TransferError>) {
        self.push(Event::State {
            tag: info.tag.clone(),
            state: info.state,
            has_error: error.is_some(),
        });
    }
}

impl MultiDownloadListener for RecordingListener {
    fn on_all_complete(&self) {
        self.push(Event::AllComplete);
    }
}

impl<T: Send + Sync> UploadListener<T> for RecordingListener {
    fn on_state_change(&self, info: &TaskInfo, error: Option<&TransferError>) {
        self.push(Event::State {
            tag: info.tag.clone(),
            state: info.state,
            has_error: error.is_some(),
        });
    }

    fn on_response(&self, response: &ResponseMeta, converted: Option<&T>) {
        self.push(Event::Response {
            status: response.status,
            converted: converted.is_some(),
        });
    }

    fn on_convert_error(&self, _error: &ConvertError) {
        self.push(Event::ConvertError);
    }
}

impl<T: Send + Sync> MultiUploadListener<T> for RecordingListener {
    fn on_all_complete(&self) {
        self.push(Event::AllComplete);
    }
}

// --------------------------------------------------------------------
/// 记录普通请求回调的结果
#[derive(Default)]
pub(crate) struct RecordingCallback {
    successes: Mutex<Vec<(u16, bool)>>,
    errors: Mutex<Vec<Arc<TransferError>>>,
    notify: tokio::sync::Notify,
}

impl RecordingCallback {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn successes(&self) -> Vec<(u16, bool)> {
        self.successes.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<Arc<TransferError>> {
        self.errors.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.successes.lock().unwrap().len() + self.errors.lock().unwrap().len()
    }

    /// 等到第一个终结回调（成功或失败）到来
    pub async fn wait_terminal(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count() > 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<T: Send + Sync> RequestCallback<T> for RecordingCallback {
    fn on_success(&self, response: &ResponseMeta, converted: Option<T>) {
        self.successes
            .lock()
            .unwrap()
            .push((response.status, converted.is_some()));
        self.notify.notify_waiters();
    }

    fn on_error(&self, error: TransferError) {
        self.errors.lock().unwrap().push(Arc::new(error));
        self.notify.notify_waiters();
    }
}
