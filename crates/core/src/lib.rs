//! Domain layer for the nudge pipeline.
//!
//! Everything in this crate is pure: event parsing, template rendering,
//! dedupe-key derivation and the retry schedule. I/O lives in the storage
//! and app crates.

pub mod dedupe;
pub mod events;
pub mod retry;
pub mod template;
pub mod types;

pub use dedupe::{dedupe_key, DedupePeriod};
pub use events::{EventParseError, ExternalEvent};
pub use retry::{BackoffPolicy, DEFAULT_MAX_RETRIES};
pub use template::render;
pub use types::{JobStatus, LeasedNudgeJob, LogStatus, NudgeChannel, RenderedNudge};
