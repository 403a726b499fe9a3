//! 测试辅助：可编排响应的 RemoteApi

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::error::Result;
use crate::remote::{CreateResult, RemoteApi, RemoteRecord};
use crate::storage::entities::{EntityKind, RecordPayload};

#[derive(Debug, Default)]
struct MockState {
    create_queue: HashMap<EntityKind, VecDeque<Result<CreateResult>>>,
    list_queue: HashMap<EntityKind, VecDeque<Result<Vec<RemoteRecord>>>>,
    lists: HashMap<EntityKind, Vec<RemoteRecord>>,
    create_calls: HashMap<String, usize>,
    list_calls: HashMap<EntityKind, usize>,
    submitted: HashMap<EntityKind, Vec<RecordPayload>>,
    next_id: i64,
}

/// 按实体类型排队的响应；队列空时 create 返回自增的 `Confirmed`，list 返回 `set_list` 设置的列表
#[derive(Debug, Default)]
pub struct MockRemoteApi {
    state: Mutex<MockState>,
    delay: Mutex<Option<Duration>>,
}

impl MockRemoteApi {
    pub fn new() -> Self {
        let mock = Self::default();
        mock.state.lock().next_id = 1000;
        mock
    }

    pub fn push_create(&self, kind: EntityKind, response: Result<CreateResult>) {
        self.state.lock().create_queue.entry(kind).or_default().push_back(response);
    }

    pub fn push_list(&self, kind: EntityKind, response: Result<Vec<RemoteRecord>>) {
        self.state.lock().list_queue.entry(kind).or_default().push_back(response);
    }

    pub fn set_list(&self, kind: EntityKind, records: Vec<RemoteRecord>) {
        self.state.lock().lists.insert(kind, records);
    }

    /// 每次请求前等待，用来制造并发重叠
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// 按匹配键统计的提交次数
    pub fn create_calls(&self, key: &str) -> usize {
        self.state.lock().create_calls.get(key).copied().unwrap_or(0)
    }

    pub fn total_create_calls(&self) -> usize {
        self.state.lock().create_calls.values().sum()
    }

    pub fn list_calls(&self, kind: EntityKind) -> usize {
        self.state.lock().list_calls.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        let state = self.state.lock();
        state.create_calls.values().sum::<usize>() + state.list_calls.values().sum::<usize>()
    }

    pub fn submitted(&self, kind: EntityKind) -> Vec<RecordPayload> {
        self.state.lock().submitted.get(&kind).cloned().unwrap_or_default()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn respond(&self, kind: EntityKind, payload: &RecordPayload) -> Result<CreateResult> {
        {
            let mut state = self.state.lock();
            *state.create_calls.entry(payload.match_key()).or_default() += 1;
            state.submitted.entry(kind).or_default().push(payload.clone());
        }
        self.pause().await;

        let mut state = self.state.lock();
        if let Some(response) = state.create_queue.get_mut(&kind).and_then(|q| q.pop_front()) {
            return response;
        }
        state.next_id += 1;
        Ok(CreateResult::Confirmed(state.next_id))
    }
}

#[async_trait]
impl RemoteApi for MockRemoteApi {
    async fn create(&self, kind: EntityKind, payload: &RecordPayload) -> Result<CreateResult> {
        self.respond(kind, payload).await
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>> {
        *self.state.lock().list_calls.entry(kind).or_default() += 1;
        self.pause().await;

        let mut state = self.state.lock();
        if let Some(response) = state.list_queue.get_mut(&kind).and_then(|q| q.pop_front()) {
            return response;
        }
        Ok(state.lists.get(&kind).cloned().unwrap_or_default())
    }

    async fn update_evaluation(&self, payload: &RecordPayload) -> Result<CreateResult> {
        self.respond(EntityKind::Evaluation, payload).await
    }

    async fn add_document(&self, payload: &RecordPayload) -> Result<CreateResult> {
        self.respond(EntityKind::Document, payload).await
    }
}
