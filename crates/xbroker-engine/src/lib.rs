//! Command-execution engine: admission control, spawn, output capture, and
//! the four execution-mode policies (foreground, adaptive, background,
//! detached) built on top of `xbroker-process` and `xbroker-stream`.

pub mod engine;
pub mod options;
pub mod registry;

pub use engine::{EngineCallbacks, ExecutionEngine};
pub use options::ExecuteOptions;
pub use registry::SupervisorRegistry;
