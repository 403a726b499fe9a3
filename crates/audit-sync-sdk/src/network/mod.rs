use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::utils::time::now_millis;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
}

/// 网络状态变化事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    /// UTC 毫秒
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    /// 是否为 离线 → 在线
    pub fn is_reconnect(&self) -> bool {
        self.old_status == NetworkStatus::Offline && self.new_status == NetworkStatus::Online
    }
}

/// 网络状态监听器trait（由平台层实现，浏览器 online/offline、系统网络回调等）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 连通性监控
///
/// 只在状态真正变化时广播 [`NetworkStatusEvent`]；同步过程中遇到传输错误时
/// 通过 [`ConnectivityMonitor::report_network_failure`] 直接降级为离线。
#[derive(Debug)]
pub struct ConnectivityMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        Self::with_capacity(listener, 100)
    }

    pub fn with_capacity(listener: Arc<dyn NetworkStatusListener>, capacity: usize) -> Self {
        let (status_sender, _) = broadcast::channel(capacity.max(1));

        Self {
            listener,
            status_sender,
            current_status: Arc::new(RwLock::new(NetworkStatus::Offline)),
            watcher: Mutex::new(None),
        }
    }

    /// 读取初始状态并启动监听任务
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.get_current_status().await;
        *self.current_status.write() = initial;
        info!("网络监控启动，初始状态: {:?}", initial);

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        transition(&current_status, &status_sender, event.new_status);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("网络状态事件积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("网络状态监听通道已关闭");
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.watcher.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// 停止监听
    pub async fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
        self.listener.stop_monitoring().await;
    }

    /// 获取当前网络状态
    pub fn get_status(&self) -> NetworkStatus {
        *self.current_status.read()
    }

    pub fn is_online(&self) -> bool {
        self.get_status() == NetworkStatus::Online
    }

    /// 手动设置网络状态，状态有变化时返回 true
    pub fn set_status(&self, new_status: NetworkStatus) -> bool {
        transition(&self.current_status, &self.status_sender, new_status)
    }

    /// 请求在传输层失败：不等平台回调，直接视为离线
    pub fn report_network_failure(&self) {
        if self.set_status(NetworkStatus::Offline) {
            warn!("请求失败，网络状态降级为离线");
        }
    }

    /// 重新读取平台状态
    ///
    /// 传输失败强制离线后，平台未必会再发一次“在线”事件；手动同步、拉取前调用它，
    /// 以平台当前状态为准。返回刷新后的状态。
    pub async fn refresh(&self) -> NetworkStatus {
        let status = self.listener.get_current_status().await;
        if self.set_status(status) {
            debug!("按平台状态刷新为 {:?}", status);
        }
        status
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

fn transition(
    current_status: &RwLock<NetworkStatus>,
    sender: &broadcast::Sender<NetworkStatusEvent>,
    new_status: NetworkStatus,
) -> bool {
    let old_status = {
        let mut status = current_status.write();
        if *status == new_status {
            return false;
        }
        std::mem::replace(&mut *status, new_status)
    };

    info!("网络状态变化: {:?} -> {:?}", old_status, new_status);
    let _ = sender.send(NetworkStatusEvent {
        old_status,
        new_status,
        timestamp: now_millis(),
    });
    true
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// 测试用：可以手动切换状态的网络监听器
    #[derive(Debug)]
    pub struct ScriptedNetworkListener {
        status: RwLock<NetworkStatus>,
        sender: broadcast::Sender<NetworkStatusEvent>,
    }

    impl ScriptedNetworkListener {
        pub fn new(initial: NetworkStatus) -> Self {
            let (sender, _) = broadcast::channel(16);
            Self {
                status: RwLock::new(initial),
                sender,
            }
        }

        pub fn online() -> Self {
            Self::new(NetworkStatus::Online)
        }

        pub fn offline() -> Self {
            Self::new(NetworkStatus::Offline)
        }

        /// 模拟平台上报状态（即使状态没变也会发送）
        pub fn set(&self, new_status: NetworkStatus) {
            let old_status = std::mem::replace(&mut *self.status.write(), new_status);
            let _ = self.sender.send(NetworkStatusEvent {
                old_status,
                new_status,
                timestamp: now_millis(),
            });
        }
    }

    #[async_trait]
    impl NetworkStatusListener for ScriptedNetworkListener {
        async fn get_current_status(&self) -> NetworkStatus {
            *self.status.read()
        }

        async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
            Ok(self.sender.subscribe())
        }

        async fn stop_monitoring(&self) {}
    }
}

#[cfg(test)]
pub use test_helpers::ScriptedNetworkListener;
