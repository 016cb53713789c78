//! The publisher's subscriber capability set.
//!
//! Modelled as a trait with default no-op hooks rather than class
//! inheritance: a subscriber declares only the callbacks it cares about.

use async_trait::async_trait;
use xbroker_core::ExecutionId;

#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_process_start(&self, _exec: ExecutionId, _command: &str) {}

    async fn on_output_data(&self, exec: ExecutionId, data: &[u8], is_stderr: bool);

    async fn on_process_end(&self, _exec: ExecutionId, _exit_code: Option<i32>) {}

    async fn on_error(&self, _exec: ExecutionId, _error: &str) {}
}
