use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// --------------------------------------------------------------------
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    /// 已入队，尚未开始
    Waiting,
    /// 执行中，期间产生进度回调
    Active,
    /// 传输成功（且转换器成功，若配置了转换器）
    Completed,
    /// 传输失败或转换失败
    Error,
    /// 调用方主动中止
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// 任务信息：一次传输的标识与可变状态。
///
/// 状态只由持有它的 worker 修改，监听器拿到的是快照。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    /// 唯一标识
    pub tag: String,
    /// 请求地址
    pub url: String,
    /// 任务状态
    pub state: TaskState,
    /// 已传输字节数
    pub current_size: u64,
    /// 预期总字节数，响应头到达前可能未知
    pub total_size: Option<u64>,
}

impl TaskInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_tag(uuid::Uuid::new_v4().to_string(), url)
    }

    pub fn with_tag(tag: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            url: url.into(),
            state: TaskState::Waiting,
            current_size: 0,
            total_size: None,
        }
    }

    // 只允许合法迁移；终态之后一律拒绝，重复取消因此是 no-op
    pub(crate) fn advance(&mut self, next: TaskState) -> bool {
        use TaskState::*;
        let ok = matches!(
            (self.state, next),
            (Waiting, Active) | (Waiting, Cancelled) | (Active, Completed) | (Active, Error) | (Active, Cancelled)
        );
        if ok {
            self.state = next;
        }
        ok
    }

    // 总量一旦确定，生命周期内不再变化
    pub(crate) fn set_total(&mut self, total: Option<u64>) {
        if self.total_size.is_none() {
            self.total_size = total;
        }
    }

    // 已传输字节数单调不减，终态后不再更新
    pub(crate) fn record_progress(&mut self, current: u64) {
        if !self.state.is_terminal() && current > self.current_size {
            self.current_size = current;
        }
    }
}

// --------------------------------------------------------------------
/// 下载信息：任务状态加保存路径。
///
/// 下载先写入临时文件，成功后再移动到 `save_path`。
#[derive(Debug, Clone)]
pub struct DownloadInfo {
    pub task: TaskInfo,
    pub save_path: PathBuf,
    temp_filename: String,
}

impl DownloadInfo {
    pub fn new(url: impl Into<String>, save_path: impl AsRef<Path>) -> Self {
        Self::with_tag(uuid::Uuid::new_v4().to_string(), url, save_path)
    }

    pub fn with_tag(
        tag: impl Into<String>,
        url: impl Into<String>,
        save_path: impl AsRef<Path>,
    ) -> Self {
        Self {
            task: TaskInfo::with_tag(tag, url),
            save_path: save_path.as_ref().to_path_buf(),
            temp_filename: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// 下载用的临时文件，完成后重命名到保存路径
    pub fn temp_path(&self) -> PathBuf {
        std::env::temp_dir().join(&self.temp_filename)
    }
}

// --------------------------------------------------------------------
/// multipart 中的一个文件分部；同一个分部名可以挂多个文件
#[derive(Debug, Clone)]
pub struct FilePart {
    pub name: String,
    pub path: PathBuf,
}

/// 上传信息：任务状态加 multipart 载荷描述
#[derive(Debug, Clone)]
pub struct UploadInfo {
    pub task: TaskInfo,
    pub param_parts: HashMap<String, String>,
    pub file_parts: Vec<FilePart>,
}

impl UploadInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_tag(uuid::Uuid::new_v4().to_string(), url)
    }

    pub fn with_tag(tag: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            task: TaskInfo::with_tag(tag, url),
            param_parts: HashMap::new(),
            file_parts: Vec::new(),
        }
    }

    /// 设置携带的普通参数
    pub fn set_param_parts(&mut self, params: HashMap<String, String>) {
        self.param_parts = params;
    }

    pub fn add_param_part(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.param_parts.insert(name.into(), value.into());
    }

    pub fn add_file_part(&mut self, name: impl Into<String>, path: impl AsRef<Path>) {
        self.file_parts.push(FilePart {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
        });
    }
}
