use std::collections::HashMap;
use std::sync::Mutex;

/// 传输层上报的字节数，可能是增量也可能是累计值
#[derive(Debug, Clone, Copy)]
pub enum ByteCount {
    /// 自任务开始以来的累计字节数
    Absolute(u64),
    /// 相对上一次上报的增量
    Delta(u64),
}

#[derive(Debug, Default)]
struct PartProgress {
    current: u64,
    total: Option<u64>,
    last_emitted: Option<(u64, Option<u64>)>,
}

/// 进度跟踪器。
///
/// 把传输层任意节奏的原始字节回调归一化成单调、去重的进度信号：
/// 增量和累计值都归一到累计值，按分部名各自单调不减，
/// 和上一次完全相同的值不再重复上报。
/// 终态判定由 worker 负责，终态后的上报在 worker 一侧直接丢弃。
#[derive(Debug, Default)]
pub struct ProgressTracker {
    parts: Mutex<HashMap<String, PartProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 上报一次字节数。
    ///
    /// 返回归一化后应该对外发出的 (累计值, 总量)；
    /// 与上次相同的重复值返回 None，表示丢弃。
    pub fn report(
        &self,
        name: &str,
        count: ByteCount,
        total: Option<u64>,
    ) -> Option<(u64, Option<u64>)> {
        let mut parts = self.parts.lock().unwrap();
        let part = parts.entry(name.to_string()).or_default();
        // 总量一旦确定不再变化
        if part.total.is_none() {
            part.total = total;
        }
        let next = match count {
            ByteCount::Delta(d) => part.current.saturating_add(d),
            // 回退的累计值不接受，保持单调
            ByteCount::Absolute(v) => v.max(part.current),
        };
        part.current = next;
        let emit = (next, part.total);
        if part.last_emitted == Some(emit) {
            return None;
        }
        part.last_emitted = Some(emit);
        Some(emit)
    }

    /// 成功收尾：总量已知时，保证最后一次对外上报的值等于总量。
    ///
    /// 需要补发时返回 (总量, 总量)，否则返回 None。
    pub fn finish(&self, name: &str) -> Option<(u64, u64)> {
        let mut parts = self.parts.lock().unwrap();
        let part = parts.get_mut(name)?;
        let total = part.total?;
        if part.current > total {
            return None;
        }
        if part.last_emitted == Some((total, Some(total))) {
            return None;
        }
        part.current = total;
        part.last_emitted = Some((total, Some(total)));
        Some((total, total))
    }

    /// 某个分部当前的累计值
    pub fn current(&self, name: &str) -> u64 {
        self.parts
            .lock()
            .unwrap()
            .get(name)
            .map(|p| p.current)
            .unwrap_or(0)
    }

    /// 所有分部累计值之和，多文件上传用它算任务整体进度
    pub fn total_reported(&self) -> u64 {
        self.parts.lock().unwrap().values().map(|p| p.current).sum()
    }
}
