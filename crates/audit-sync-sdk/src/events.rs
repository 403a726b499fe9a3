//! 事件系统模块 - 同步引擎对 UI 的通知出口
//!
//! 功能包括：
//! - 记录保存 / 同步成功 / 同步失败事件
//! - 网络状态变化事件
//! - 同步轮次完成、拉取完成事件
//! - 事件广播和订阅机制

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::network::{NetworkStatus, NetworkStatusEvent};
use crate::storage::entities::EntityKind;
use crate::sync::coordinator::SyncSummary;
use crate::sync::dedup::DedupReport;
use crate::sync::matcher::MatchRule;
use crate::utils::time::now_millis;

/// SDK 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 记录已写入本地存储
    RecordSaved {
        kind: EntityKind,
        local_id: i64,
        timestamp: i64,
    },
    /// 记录已在服务端确认，本地副本已删除
    RecordSynced {
        kind: EntityKind,
        local_id: i64,
        /// 乐观处理未知结果时没有服务端 ID
        server_id: Option<i64>,
        /// 命中的匹配规则；乐观处理未知结果时为 None
        rule: Option<MatchRule>,
        timestamp: i64,
    },
    /// 记录同步失败，保留在本地等待下一轮
    RecordSyncFailed {
        kind: EntityKind,
        local_id: i64,
        reason: String,
        timestamp: i64,
    },
    ConnectivityChanged {
        old_status: NetworkStatus,
        new_status: NetworkStatus,
        timestamp: i64,
    },
    /// 一轮 sync_all 结束（离线跳过也会发）
    PassCompleted(SyncSummary),
    /// 至少有一条记录同步成功，UI 应重新加载列表
    RefreshRequested {
        pass_id: String,
        timestamp: i64,
    },
    /// 一次整表拉取与去重完成
    PullCompleted {
        kind: EntityKind,
        report: DedupReport,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型名称
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::RecordSaved { .. } => "record_saved",
            SyncEvent::RecordSynced { .. } => "record_synced",
            SyncEvent::RecordSyncFailed { .. } => "record_sync_failed",
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SyncEvent::PassCompleted(_) => "pass_completed",
            SyncEvent::RefreshRequested { .. } => "refresh_requested",
            SyncEvent::PullCompleted { .. } => "pull_completed",
        }
    }

    /// 事件涉及的实体类型
    pub fn kind(&self) -> Option<EntityKind> {
        match self {
            SyncEvent::RecordSaved { kind, .. }
            | SyncEvent::RecordSynced { kind, .. }
            | SyncEvent::RecordSyncFailed { kind, .. }
            | SyncEvent::PullCompleted { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::RecordSaved { timestamp, .. }
            | SyncEvent::RecordSynced { timestamp, .. }
            | SyncEvent::RecordSyncFailed { timestamp, .. }
            | SyncEvent::ConnectivityChanged { timestamp, .. }
            | SyncEvent::RefreshRequested { timestamp, .. }
            | SyncEvent::PullCompleted { timestamp, .. } => *timestamp,
            SyncEvent::PassCompleted(summary) => summary.finished_at,
        }
    }

    pub fn record_saved(kind: EntityKind, local_id: i64) -> Self {
        SyncEvent::RecordSaved { kind, local_id, timestamp: now_millis() }
    }

    pub fn record_synced(kind: EntityKind, local_id: i64, server_id: Option<i64>, rule: Option<MatchRule>) -> Self {
        SyncEvent::RecordSynced { kind, local_id, server_id, rule, timestamp: now_millis() }
    }

    pub fn record_sync_failed(kind: EntityKind, local_id: i64, reason: impl Into<String>) -> Self {
        SyncEvent::RecordSyncFailed { kind, local_id, reason: reason.into(), timestamp: now_millis() }
    }
}

impl From<NetworkStatusEvent> for SyncEvent {
    fn from(event: NetworkStatusEvent) -> Self {
        SyncEvent::ConnectivityChanged {
            old_status: event.old_status,
            new_status: event.new_status,
            timestamp: event.timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 实体类型过滤器
    pub kinds: Option<Vec<EntityKind>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<EntityKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds {
            match event.kind() {
                Some(kind) if kinds.contains(&kind) => {}
                _ => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SyncEvent>,
    /// 事件监听器映射（"*" 为通用监听器）
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有订阅者时 send 会失败，属正常情况
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器（event_type 为 "*" 时接收所有事件）
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners.entry(event_type.to_string()).or_default().push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
