//! Fan-out of output events to a set of subscribers, per execution.
//!
//! Ordering is the whole point of this type: `start ≤ data* ≤ end` per
//! execution, and one subscriber's failure never blocks delivery to the
//! others. Subscriber hooks are infallible by signature; implementations
//! that can fail (file I/O, store writes) are responsible for catching and
//! logging their own errors rather than panicking.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use xbroker_core::ExecutionId;

use crate::subscriber::Subscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

pub struct StreamPublisher {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    per_execution: RwLock<HashMap<ExecutionId, HashSet<SubscriberId>>>,
}

impl Default for StreamPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamPublisher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
            per_execution: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `subscriber` as interested in `exec`'s events.
    pub async fn subscribe(&self, exec: ExecutionId, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().await.insert(id, subscriber);
        self.per_execution
            .write()
            .await
            .entry(exec)
            .or_default()
            .insert(id);
        id
    }

    pub async fn unsubscribe(&self, exec: ExecutionId, id: SubscriberId) {
        if let Some(set) = self.per_execution.write().await.get_mut(&exec) {
            set.remove(&id);
        }
        self.subscribers.write().await.remove(&id);
    }

    pub async fn publish_start(&self, exec: ExecutionId, command: &str) {
        for subscriber in self.subscribers_for(exec).await {
            subscriber.on_process_start(exec, command).await;
        }
    }

    pub async fn publish_data(&self, exec: ExecutionId, data: &[u8], is_stderr: bool) {
        for subscriber in self.subscribers_for(exec).await {
            subscriber.on_output_data(exec, data, is_stderr).await;
        }
    }

    /// Delivers `onProcessEnd` to every subscriber, then drops the
    /// per-execution subscription set per spec §4.3.
    pub async fn publish_end(&self, exec: ExecutionId, exit_code: Option<i32>) {
        for subscriber in self.subscribers_for(exec).await {
            subscriber.on_process_end(exec, exit_code).await;
        }
        self.per_execution.write().await.remove(&exec);
    }

    pub async fn publish_error(&self, exec: ExecutionId, error: &str) {
        for subscriber in self.subscribers_for(exec).await {
            subscriber.on_error(exec, error).await;
        }
    }

    async fn subscribers_for(&self, exec: ExecutionId) -> Vec<Arc<dyn Subscriber>> {
        let per_execution = self.per_execution.read().await;
        let Some(ids) = per_execution.get(&exec) else {
            return Vec::new();
        };
        let subscribers = self.subscribers.read().await;
        ids.iter().filter_map(|id| subscribers.get(id).cloned()).collect()
    }
}
