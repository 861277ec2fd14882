//! Shared types for dreamdeck: requests, capabilities, the error taxonomy,
//! configuration, and the host-thread task queue.

pub mod capabilities;
pub mod config;
pub mod errors;
pub mod queue;
pub mod reporter;
pub mod request;

pub use capabilities::BackendCapabilities;
pub use config::{BackendSettings, Settings};
pub use errors::{ErrorKey, GenerationError, GenerationResult, HighlightField};
pub use queue::{DrainReport, HostScheduler, QueuedTask, TaskQueue};
pub use reporter::{ErrorReporter, UiNotifier};
pub use request::{BackendId, GenerationRequest, Sampler, Seed, UpscaleRequest};
