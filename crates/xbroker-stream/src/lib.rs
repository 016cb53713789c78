//! Output pub/sub fabric: publisher, file and ring subscribers, pipeline reader.

pub mod file_subscriber;
pub mod pipeline_reader;
pub mod publisher;
pub mod ring_subscriber;
pub mod subscriber;

pub use file_subscriber::FileSubscriber;
pub use pipeline_reader::{PipelineReader, PipelineReaderConfig};
pub use publisher::{StreamPublisher, SubscriberId};
pub use ring_subscriber::{RingChunk, RingConfig, RingSubscriber, StreamState};
pub use subscriber::Subscriber;
