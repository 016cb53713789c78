//! Tracks accepted executions and enforces the concurrency admission cap.
//!
//! Only a `pid` is tracked per running execution, not the owning `Child` —
//! the `Child` handle lives inside the task that spawned it and is what
//! actually reaps the process; the registry's job is bookkeeping plus
//! being able to signal a pid directly when a caller asks to stop one by
//! `ExecutionId` without going through that task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};
use xbroker_core::{BrokerError, ExecutionId, ExecutionRecord, ExecutionStatus};

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

pub struct SupervisorRegistry {
    max_concurrent: usize,
    executions: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
    pids: RwLock<HashMap<ExecutionId, u32>>,
}

impl SupervisorRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            executions: RwLock::new(HashMap::new()),
            pids: RwLock::new(HashMap::new()),
        }
    }

    /// Counts running executions and errors if admitting one more would
    /// exceed the configured cap. Callers must call this before spawning.
    pub async fn try_admit(&self) -> Result<(), BrokerError> {
        let running = self.running_count().await;
        if running >= self.max_concurrent {
            return Err(BrokerError::ResourceLimit {
                running,
                max: self.max_concurrent,
            });
        }
        Ok(())
    }

    pub async fn running_count(&self) -> usize {
        self.executions
            .read()
            .await
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    pub async fn insert(&self, record: ExecutionRecord) {
        self.executions.write().await.insert(record.id, record);
    }

    /// Checks the admission cap and inserts `record` under a single write
    /// lock, so two concurrent callers racing past the cap can't both be
    /// admitted before either's insert lands (`try_admit` then `insert` as
    /// separate calls would let exactly that happen).
    pub async fn try_admit_and_insert(&self, record: ExecutionRecord) -> Result<(), BrokerError> {
        let mut executions = self.executions.write().await;
        let running = executions.values().filter(|r| !r.status.is_terminal()).count();
        if running >= self.max_concurrent {
            return Err(BrokerError::ResourceLimit {
                running,
                max: self.max_concurrent,
            });
        }
        executions.insert(record.id, record);
        Ok(())
    }

    pub async fn set_pid(&self, id: ExecutionId, pid: u32) {
        self.pids.write().await.insert(id, pid);
        if let Some(record) = self.executions.write().await.get_mut(&id) {
            record.pid = Some(pid);
        }
    }

    pub async fn get(&self, id: ExecutionId) -> Result<ExecutionRecord, BrokerError> {
        self.executions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(BrokerError::UnknownExecution(id))
    }

    pub async fn list(&self) -> Vec<ExecutionRecord> {
        self.executions.read().await.values().cloned().collect()
    }

    /// Applies `f` to the record for `id`, if one exists.
    pub async fn update<F: FnOnce(&mut ExecutionRecord)>(&self, id: ExecutionId, f: F) {
        if let Some(record) = self.executions.write().await.get_mut(&id) {
            f(record);
        }
    }

    /// Drops the pid once an execution has fully exited, so a stale pid
    /// can never be re-signalled after the kernel has reused it.
    pub async fn clear_pid(&self, id: ExecutionId) {
        self.pids.write().await.remove(&id);
    }

    /// Sends `signal` to the process group of the execution's tracked pid.
    pub async fn signal(&self, id: ExecutionId, signal: i32) -> Result<(), BrokerError> {
        let pid = self
            .pids
            .read()
            .await
            .get(&id)
            .copied()
            .ok_or(BrokerError::UnknownExecution(id))?;
        send_signal_to_group(pid, signal);
        Ok(())
    }

    /// SIGTERM then, after `grace`, SIGKILL — without a `Child` handle to
    /// wait on, this just re-signals; the spawning task's own `child.wait()`
    /// observes the exit and updates the record's status.
    pub async fn kill_process(&self, id: ExecutionId, grace: Duration) -> Result<(), BrokerError> {
        self.signal(id, libc::SIGTERM).await?;
        let registry = self;
        let id = id;
        tokio::time::sleep(grace).await;
        if registry.pids.read().await.contains_key(&id) {
            let _ = registry.signal(id, libc::SIGKILL).await;
        }
        Ok(())
    }

    /// Terminates every still-running execution with the standard grace
    /// window. Used on daemon shutdown.
    pub async fn cleanup(self: &Arc<Self>) {
        let running: Vec<ExecutionId> = self
            .executions
            .read()
            .await
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id)
            .collect();

        for id in running {
            info!(%id, "terminating execution during cleanup");
            if let Err(error) = self.kill_process(id, DEFAULT_KILL_GRACE).await {
                warn!(%id, %error, "failed to signal execution during cleanup");
            }
        }
    }
}

fn send_signal_to_group(pid: u32, signal: i32) {
    #[cfg(unix)]
    {
        // SAFETY: kill() is async-signal-safe; negative pid targets the group.
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}
