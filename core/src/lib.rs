#![deny(missing_docs)]
//! retry_core: durable capture and scheduled replay of failed handler calls.
//!
//! A failed invocation of a registered [`RetryHandler`] leaves a task in the
//! [`TaskStore`]; a per-handler job replays pending tasks until they succeed.

/// Configuration helpers (AppId, dirs, load_or_init, etc.)
pub mod cfg;
/// Argument serialization for persisted tasks.
pub mod codec;
/// Error types.
pub mod error;
/// Handler capability, schedules and validation.
pub mod handler;
/// Identity to live wrapper lookup.
pub mod registry;
/// Failure-capture wrapper.
pub mod capture;
/// Retry pass over pending tasks.
pub mod processor;
/// Replay outcome callbacks.
pub mod listener;
/// Job model shared by the scheduler backends.
pub mod job;
/// Local and distributed scheduler backends.
pub mod scheduler;
/// Call interception.
pub mod intercept;
/// Registration pipeline.
pub mod engine;
/// Tracing/log initialization helpers.
pub mod logx;
/// Simple file-backed KV store with serde helpers.
pub mod store;
/// Retry task model and stores.
pub mod task;

pub use capture::FailureCapture;
pub use codec::Codec;
pub use engine::{RetryEngine, RetryEngineBuilder};
pub use error::{Result, RetryError};
pub use handler::{BackendKind, MethodHandler, RetryAttrs, RetryHandler};
pub use intercept::{HandlerClassInterceptor, RetryFunctionInterceptor};
pub use listener::RetryListener;
pub use job::{JobInfo, JobStatus};
pub use registry::DispatchRegistry;
pub use task::{RetryTask, TaskState, TaskStore};
