//! Device configuration sync
//!
//! A [`ConfigSource`] stores the versioned [`ConfigDocument`] of a device,
//! either in a local file or on the management controller. [`SyncEngine`]
//! wraps a source with read-modify-write sessions that only commit real
//! changes.

mod controller;
mod document;
mod engine;
mod file;
pub mod source;

pub use controller::ControllerSource;
pub use document::ConfigDocument;
pub use engine::{CloseOutcome, SyncEngine, SyncError, SyncSession};
pub use file::FileSource;
pub use source::{ConfigError, ConfigSource, SourceKind};
