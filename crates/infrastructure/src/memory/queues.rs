use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;

use conveyor_domain::QueueKind;
use conveyor_errors::{ConveyorError, ConveyorResult};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// 优先级队列中的堆元素
///
/// 最大堆按priority取大，同priority时按入队序号取小（FIFO打破平局）。
#[derive(Debug, Clone)]
struct PrioItem {
    priority: i64,
    seq: u64,
    item: Value,
}

impl PartialEq for PrioItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PrioItem {}

impl Ord for PrioItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for PrioItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
enum QueueStore {
    Fifo(VecDeque<Value>),
    Stack(Vec<Value>),
    Priority { heap: BinaryHeap<PrioItem>, next_seq: u64 },
}

impl QueueStore {
    fn new(kind: QueueKind) -> Self {
        match kind {
            QueueKind::Fifo => QueueStore::Fifo(VecDeque::new()),
            QueueKind::Stack => QueueStore::Stack(Vec::new()),
            QueueKind::Priority => QueueStore::Priority {
                heap: BinaryHeap::new(),
                next_seq: 0,
            },
        }
    }

    fn push(&mut self, item: Value, priority: Option<i64>) {
        match self {
            QueueStore::Fifo(items) => items.push_back(item),
            QueueStore::Stack(items) => items.push(item),
            QueueStore::Priority { heap, next_seq } => {
                heap.push(PrioItem {
                    priority: priority.unwrap_or(0),
                    seq: *next_seq,
                    item,
                });
                *next_seq += 1;
            }
        }
    }

    fn pop(&mut self) -> Option<Value> {
        match self {
            QueueStore::Fifo(items) => items.pop_front(),
            QueueStore::Stack(items) => items.pop(),
            QueueStore::Priority { heap, .. } => heap.pop().map(|entry| entry.item),
        }
    }

    fn len(&self) -> usize {
        match self {
            QueueStore::Fifo(items) => items.len(),
            QueueStore::Stack(items) => items.len(),
            QueueStore::Priority { heap, .. } => heap.len(),
        }
    }

    fn clear(&mut self) -> u64 {
        let count = self.len() as u64;
        match self {
            QueueStore::Fifo(items) => items.clear(),
            QueueStore::Stack(items) => items.clear(),
            QueueStore::Priority { heap, .. } => heap.clear(),
        }
        count
    }
}

/// 进程内队列容器
///
/// FIFO严格按插入序，Stack按逆插入序，Priority按优先级最大堆，
/// 同优先级按入队先后（负优先级合法，排在零之下）。
/// 阻塞pop在条目到达或超时前挂起，超时/非阻塞空队列返回 `QueueEmpty`。
#[derive(Debug)]
pub struct MemoryQueue {
    kind: QueueKind,
    store: Mutex<QueueStore>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            store: Mutex::new(QueueStore::new(kind)),
            notify: Notify::new(),
        }
    }

    pub fn fifo() -> Self {
        Self::new(QueueKind::Fifo)
    }
    pub fn stack() -> Self {
        Self::new(QueueKind::Stack)
    }
    pub fn priority() -> Self {
        Self::new(QueueKind::Priority)
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub async fn push(&self, item: Value, priority: Option<i64>) {
        let mut store = self.store.lock().await;
        store.push(item, priority);
        drop(store);
        self.notify.notify_one();
    }

    /// 取出下一条消息
    ///
    /// `block=false` 时空队列立即返回 `QueueEmpty`；
    /// `block=true` 时等待新条目，超时后返回 `QueueEmpty`。
    pub async fn pop(&self, block: bool, timeout: Option<Duration>) -> ConveyorResult<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            {
                let mut store = self.store.lock().await;
                if let Some(item) = store.pop() {
                    return Ok(item);
                }
            }
            if !block {
                return Err(ConveyorError::QueueEmpty);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ConveyorError::QueueEmpty);
                    }
                    if tokio::time::timeout(deadline - now, notified).await.is_err() {
                        return Err(ConveyorError::QueueEmpty);
                    }
                }
                None => notified.await,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 清空队列，返回被清除的条目数
    pub async fn clean(&self) -> u64 {
        self.store.lock().await.clear()
    }

    /// 导出可持久化的快照
    ///
    /// fifo/stack为 `{"items": [...]}`（插入序）；
    /// priority为 `{"items": [{"item": ..., "priority": ...}, ...]}`（出队序）。
    pub async fn snapshot(&self) -> Value {
        let store = self.store.lock().await;
        match &*store {
            QueueStore::Fifo(items) => {
                json!({"items": items.iter().cloned().collect::<Vec<_>>()})
            }
            QueueStore::Stack(items) => json!({"items": items.clone()}),
            QueueStore::Priority { heap, .. } => {
                let mut entries: Vec<&PrioItem> = heap.iter().collect();
                entries.sort_by(|a, b| b.cmp(a));
                json!({
                    "items": entries
                        .iter()
                        .map(|entry| json!({"item": entry.item, "priority": entry.priority}))
                        .collect::<Vec<_>>()
                })
            }
        }
    }

    /// 从快照恢复；priority快照按数组顺序重新编号，保持出队序
    pub async fn restore(&self, snapshot: &Value) -> ConveyorResult<()> {
        let items = snapshot
            .get("items")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                ConveyorError::Serialization("快照缺少items数组".to_string())
            })?;

        let mut store = self.store.lock().await;
        *store = QueueStore::new(self.kind);
        match self.kind {
            QueueKind::Fifo | QueueKind::Stack => {
                for item in items {
                    store.push(item.clone(), None);
                }
            }
            QueueKind::Priority => {
                for entry in items {
                    let item = entry.get("item").cloned().ok_or_else(|| {
                        ConveyorError::Serialization("优先级快照条目缺少item".to_string())
                    })?;
                    let priority = entry.get("priority").and_then(|p| p.as_i64());
                    store.push(item, priority);
                }
            }
        }
        drop(store);
        self.notify.notify_one();
        Ok(())
    }
}
