//! Per-execution bounded ring of sequenced output chunks.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use xbroker_core::ExecutionId;

use crate::subscriber::Subscriber;

#[derive(Debug, Clone)]
pub struct RingChunk {
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub is_stderr: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamState {
    pub is_active: bool,
    pub last_sequence: i64,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Per-chunk target size; informational only — chunks arrive pre-sized
    /// from the pipe reader and are never split or merged here.
    pub buffer_size: usize,
    pub max_buffers: usize,
    pub max_retention: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            max_buffers: 1000,
            max_retention: Duration::from_secs(300),
        }
    }
}

struct RingState {
    chunks: VecDeque<RingChunk>,
    next_sequence: u64,
    is_active: bool,
    last_touched: Instant,
}

impl RingState {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            next_sequence: 0,
            is_active: false,
            last_touched: Instant::now(),
        }
    }
}

pub struct RingSubscriber {
    config: RingConfig,
    state: Mutex<HashMap<ExecutionId, RingState>>,
}

impl RingSubscriber {
    pub fn new(config: RingConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_buffers(&self) -> usize {
        self.config.max_buffers
    }

    pub async fn get_stream_state(&self, exec: ExecutionId) -> Option<StreamState> {
        let state = self.state.lock().await;
        state.get(&exec).map(|s| StreamState {
            is_active: s.is_active,
            last_sequence: s.chunks.back().map(|c| c.sequence_number as i64).unwrap_or(-1),
            chunk_count: s.chunks.len(),
        })
    }

    pub async fn get_latest_buffers(&self, exec: ExecutionId, n: usize) -> Vec<RingChunk> {
        let state = self.state.lock().await;
        match state.get(&exec) {
            Some(s) => {
                let len = s.chunks.len();
                let skip = len.saturating_sub(n);
                s.chunks.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub async fn get_buffers_from_sequence(
        &self,
        exec: ExecutionId,
        from_seq: u64,
        max_count: usize,
    ) -> Vec<RingChunk> {
        let state = self.state.lock().await;
        match state.get(&exec) {
            Some(s) => s
                .chunks
                .iter()
                .filter(|c| c.sequence_number >= from_seq)
                .take(max_count)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drops executions whose last chunk is older than `max_retention`.
    pub async fn sweep_expired(&self) {
        let mut state = self.state.lock().await;
        let retention = self.config.max_retention;
        state.retain(|_, s| s.last_touched.elapsed() < retention);
    }

    fn trim(&self, ring: &mut RingState) {
        while ring.chunks.len() > self.config.max_buffers {
            ring.chunks.pop_front();
        }
    }
}

#[async_trait]
impl Subscriber for RingSubscriber {
    async fn on_output_data(&self, exec: ExecutionId, data: &[u8], is_stderr: bool) {
        let mut state = self.state.lock().await;
        let entry = state.entry(exec).or_insert_with(RingState::new);
        let sequence_number = entry.next_sequence;
        entry.next_sequence += 1;
        entry.is_active = true;
        entry.last_touched = Instant::now();
        entry.chunks.push_back(RingChunk {
            sequence_number,
            timestamp: Utc::now(),
            data: data.to_vec(),
            is_stderr,
        });
        self.trim(entry);
    }

    async fn on_process_end(&self, exec: ExecutionId, _exit_code: Option<i32>) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(&exec) {
            entry.is_active = false;
            entry.last_touched = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_numbers_are_dense_and_start_at_zero() {
        let ring = RingSubscriber::new(RingConfig::default());
        let exec = ExecutionId::new();
        for chunk in [b"a".as_slice(), b"b", b"c"] {
            ring.on_output_data(exec, chunk, false).await;
        }
        let state = ring.get_stream_state(exec).await.unwrap();
        assert!(state.is_active);
        assert_eq!(state.last_sequence, 2);
        assert_eq!(state.chunk_count, 3);

        let buffers = ring.get_buffers_from_sequence(exec, 0, 10).await;
        let seqs: Vec<u64> = buffers.iter().map(|c| c.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn on_process_end_deactivates_but_retains_chunks() {
        let ring = RingSubscriber::new(RingConfig::default());
        let exec = ExecutionId::new();
        ring.on_output_data(exec, b"x", false).await;
        ring.on_process_end(exec, Some(0)).await;

        let state = ring.get_stream_state(exec).await.unwrap();
        assert!(!state.is_active);
        assert_eq!(state.chunk_count, 1);
    }

    #[tokio::test]
    async fn trims_oldest_chunks_beyond_max_buffers() {
        let ring = RingSubscriber::new(RingConfig {
            max_buffers: 2,
            ..RingConfig::default()
        });
        let exec = ExecutionId::new();
        ring.on_output_data(exec, b"1", false).await;
        ring.on_output_data(exec, b"2", false).await;
        ring.on_output_data(exec, b"3", false).await;

        let state = ring.get_stream_state(exec).await.unwrap();
        assert_eq!(state.chunk_count, 2);
        let latest = ring.get_latest_buffers(exec, 10).await;
        let seqs: Vec<u64> = latest.iter().map(|c| c.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn get_latest_buffers_caps_at_n() {
        let ring = RingSubscriber::new(RingConfig::default());
        let exec = ExecutionId::new();
        for i in 0..5u8 {
            ring.on_output_data(exec, &[i], false).await;
        }
        let latest = ring.get_latest_buffers(exec, 2).await;
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].sequence_number, 3);
        assert_eq!(latest[1].sequence_number, 4);
    }
}
