//! Lazy byte-oriented reader that drains a persisted artifact, then follows
//! its still-growing live stream, with no duplication at the join.

use std::sync::Arc;
use std::time::{Duration, Instant};

use xbroker_core::{BrokerError, ExecutionId, OutputId};
use xbroker_output::OutputStore;

use crate::ring_subscriber::RingSubscriber;

#[derive(Debug, Clone, Copy)]
pub struct PipelineReaderConfig {
    pub polling_interval: Duration,
    pub read_timeout: Duration,
    pub ring_fetch_count: usize,
    pub file_chunk_size: usize,
}

impl Default for PipelineReaderConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(100),
            read_timeout: Duration::from_secs(30),
            ring_fetch_count: 50,
            file_chunk_size: 64 * 1024,
        }
    }
}

enum Phase {
    FileDrain { cursor: u64 },
    RingFollow { last_emitted_seq: i64 },
}

/// Two-phase reader over an `OutputId` whose owning execution may still be
/// running. See spec §4.5 for the handoff guarantee this implements.
pub struct PipelineReader {
    store: Arc<OutputStore>,
    ring: Arc<RingSubscriber>,
    output_id: OutputId,
    execution_id: ExecutionId,
    phase: Phase,
    config: PipelineReaderConfig,
}

impl PipelineReader {
    pub fn new(
        store: Arc<OutputStore>,
        ring: Arc<RingSubscriber>,
        output_id: OutputId,
        execution_id: ExecutionId,
        config: PipelineReaderConfig,
    ) -> Self {
        Self {
            store,
            ring,
            output_id,
            execution_id,
            phase: Phase::FileDrain { cursor: 0 },
            config,
        }
    }

    /// Returns the next chunk of bytes, or `None` at end-of-stream.
    pub async fn read_next(&mut self) -> Result<Option<Vec<u8>>, BrokerError> {
        let deadline = Instant::now() + self.config.read_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(BrokerError::PipelineReadTimeout(self.config.read_timeout));
            }

            match self.phase {
                Phase::FileDrain { cursor } => {
                    let read = self
                        .store
                        .read_by_offset(self.output_id, cursor, self.config.file_chunk_size)
                        .await?;

                    if !read.content.is_empty() {
                        self.phase = Phase::FileDrain {
                            cursor: cursor + read.content.len() as u64,
                        };
                        return Ok(Some(read.content));
                    }

                    let state = self
                        .ring
                        .get_stream_state(self.execution_id)
                        .await
                        .ok_or(BrokerError::MissingStreamState(self.execution_id))?;

                    if !state.is_active {
                        return Ok(None);
                    }

                    let last_emitted_seq = self.estimate_handoff_sequence(cursor).await;
                    self.phase = Phase::RingFollow { last_emitted_seq };
                }
                Phase::RingFollow { last_emitted_seq } => {
                    let from_seq = (last_emitted_seq + 1).max(0) as u64;
                    let chunks = self
                        .ring
                        .get_buffers_from_sequence(self.execution_id, from_seq, self.config.ring_fetch_count)
                        .await;

                    if chunks.is_empty() {
                        let state = self.ring.get_stream_state(self.execution_id).await;
                        match state {
                            Some(s) if s.is_active => {
                                tokio::time::sleep(self.config.polling_interval).await;
                                continue;
                            }
                            _ => return Ok(None),
                        }
                    }

                    let mut data = Vec::new();
                    let mut max_seq = last_emitted_seq;
                    for chunk in &chunks {
                        data.extend_from_slice(&chunk.data);
                        max_seq = max_seq.max(chunk.sequence_number as i64);
                    }
                    self.phase = Phase::RingFollow {
                        last_emitted_seq: max_seq,
                    };
                    return Ok(Some(data));
                }
            }
        }
    }

    /// Walks the ring's retained buffers (oldest first, as returned by
    /// `get_latest_buffers`) accumulating a running prefix length of
    /// stdout bytes until it would exceed the file cursor, to find the
    /// sequence number already fully represented by the persisted file.
    ///
    /// Only stdout chunks count toward the running total: the file only
    /// receives stdout in real time (`FileSubscriber` holds stderr back
    /// until `onProcessEnd`), so a cursor that also counted stderr bytes
    /// would overshoot and skip ring chunks the file hasn't actually
    /// caught up to yet.
    async fn estimate_handoff_sequence(&self, file_cursor: u64) -> i64 {
        let latest = self
            .ring
            .get_latest_buffers(self.execution_id, self.ring.max_buffers())
            .await;

        let mut running: u64 = 0;
        let mut seq: i64 = -1;
        for chunk in &latest {
            if chunk.is_stderr {
                seq = chunk.sequence_number as i64;
                continue;
            }
            let next = running + chunk.data.len() as u64;
            if next > file_cursor {
                break;
            }
            running = next;
            seq = chunk.sequence_number as i64;
        }
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::Subscriber;
    use xbroker_core::OutputKind;

    #[tokio::test]
    async fn drains_file_then_switches_to_ring_without_duplication() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OutputStore::new(dir.path().to_path_buf()));
        let ring = Arc::new(RingSubscriber::new(crate::ring_subscriber::RingConfig::default()));
        let exec = ExecutionId::new();

        // Only the first chunk has made it to the file so far; the ring,
        // fed from the same publisher, is one chunk ahead of it — the
        // ordinary race the handoff estimate exists to resolve.
        let output_id = store
            .create_from_string(OutputKind::Combined, "persisted-", Some(exec))
            .await
            .unwrap();

        ring.on_output_data(exec, b"persisted-", false).await;
        ring.on_output_data(exec, b"live-a", false).await;
        ring.on_output_data(exec, b"live-b", false).await;
        // still active: no onProcessEnd yet

        let mut reader = PipelineReader::new(
            store.clone(),
            ring.clone(),
            output_id,
            exec,
            PipelineReaderConfig::default(),
        );

        let mut collected = Vec::new();
        let chunk = reader.read_next().await.unwrap().unwrap();
        collected.extend_from_slice(&chunk);

        let chunk = reader.read_next().await.unwrap().unwrap();
        collected.extend_from_slice(&chunk);

        ring.on_process_end(exec, Some(0)).await;
        assert!(reader.read_next().await.unwrap().is_none());

        assert_eq!(String::from_utf8(collected).unwrap(), "persisted-live-alive-b");
    }

    #[tokio::test]
    async fn missing_stream_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OutputStore::new(dir.path().to_path_buf()));
        let ring = Arc::new(RingSubscriber::new(crate::ring_subscriber::RingConfig::default()));
        let exec = ExecutionId::new();
        let output_id = store
            .create_from_string(OutputKind::Combined, "", Some(exec))
            .await
            .unwrap();

        let mut reader = PipelineReader::new(store, ring, output_id, exec, PipelineReaderConfig::default());
        let result = reader.read_next().await;
        assert!(matches!(result, Err(BrokerError::MissingStreamState(_))));
    }
}
