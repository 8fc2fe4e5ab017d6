//! Story-generation orchestration.
//!
//! A session moves through a fixed phase sequence
//! (`compression → analysis → outline → breakdown → chapter1 → continuation`).
//! [`scheduler::RunScheduler`] admits and bounds runs, and
//! [`pipeline::PipelineExecutor`] executes one phase per run against a
//! streaming [`provider::CompletionProvider`]. Chapter phases feed the
//! [`consistency`] checker in the background.

pub mod compression;
pub mod config;
pub mod consistency;
pub mod errors;
pub mod logging;
pub mod phase;
pub mod pipeline;
pub mod prompt;
pub mod provider;
pub mod scheduler;
pub mod store;
pub mod util;

pub use errors::{PipelineError, ProviderError, StoreError};
pub use phase::Phase;
