//! 网络恢复后自动同步
//!
//! 消费 [`ConnectivityMonitor`] 的状态事件：离线 → 在线时等待一段稳定时间，
//! 确认仍然在线后执行一轮 `sync_all`。所有状态变化同时转发为 `SyncEvent::ConnectivityChanged`。

use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{EventManager, SyncEvent};
use crate::network::ConnectivityMonitor;
use crate::sync::coordinator::SyncCoordinator;

/// 自动同步运行器
pub struct AutoSyncRunner {
    coordinator: Arc<SyncCoordinator>,
    monitor: Arc<ConnectivityMonitor>,
    events: Arc<EventManager>,
    settle_delay: Duration,
    shutdown_signal: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AutoSyncRunner {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        monitor: Arc<ConnectivityMonitor>,
        events: Arc<EventManager>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            coordinator,
            monitor,
            events,
            settle_delay,
            shutdown_signal: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(false)),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// 启动事件消费任务（重复调用无副作用）
    pub async fn start(&self) {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return;
            }
            *running = true;
        }

        let receiver = self.monitor.subscribe();
        let task = AutoSyncTask {
            coordinator: self.coordinator.clone(),
            monitor: self.monitor.clone(),
            events: self.events.clone(),
            settle_delay: self.settle_delay,
            shutdown_signal: self.shutdown_signal.clone(),
        };
        let handle = tokio::spawn(task.run(receiver));
        *self.handle.lock() = Some(handle);
        info!("🚀 自动同步已启动 (settle_delay={} ms)", self.settle_delay.as_millis());
    }

    /// 停止并等待任务退出；正在进行的同步轮次会先跑完
    pub async fn stop(&self) {
        {
            let mut running = self.is_running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }

        self.shutdown_signal.notify_one();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("自动同步任务异常退出: {}", e);
            }
        }
        info!("🛑 自动同步已停止");
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}

struct AutoSyncTask {
    coordinator: Arc<SyncCoordinator>,
    monitor: Arc<ConnectivityMonitor>,
    events: Arc<EventManager>,
    settle_delay: Duration,
    shutdown_signal: Arc<Notify>,
}

impl AutoSyncTask {
    async fn run(self, mut receiver: broadcast::Receiver<crate::network::NetworkStatusEvent>) {
        loop {
            let event = select! {
                _ = self.shutdown_signal.notified() => break,
                event = receiver.recv() => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("网络事件积压，跳过 {} 条", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            self.events.emit(SyncEvent::from(event.clone())).await;
            if !event.is_reconnect() {
                continue;
            }

            // 网络刚恢复时往往还不稳定，等一会儿再确认
            select! {
                _ = self.shutdown_signal.notified() => break,
                _ = tokio::time::sleep(self.settle_delay) => {}
            }
            if !self.monitor.is_online() {
                debug!("稳定等待期间网络再次断开，放弃本次自动同步");
                continue;
            }

            info!("📶 网络已恢复，开始自动同步");
            if let Err(e) = self.coordinator.sync_all().await {
                error!("自动同步失败: {}", e);
            }
        }
        debug!("自动同步任务退出");
    }
}
