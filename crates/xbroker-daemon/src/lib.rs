//! Unix-socket daemon server: connection handling, attach/heartbeat
//! liveness, and the workspace locator used to discover attachable
//! daemons for a given working directory.

pub mod locator;
pub mod server;
pub mod socket;
pub mod tool_runtime;

pub use locator::{list_attachable, AttachableDaemon, SOCKET_CONNECT_TIMEOUT_MS};
pub use server::{DaemonServer, HEARTBEAT_TIMEOUT_MS, SOCKET_REQUEST_TIMEOUT_MS};
pub use tool_runtime::{EmptyToolRuntime, EngineToolRuntime, ToolRuntime};
