pub mod acquisition;
pub mod archive;
pub mod artifact;
pub mod cleanup;
pub mod config;
pub mod constants;
pub mod dedupe;
pub mod error;
pub mod export;
pub mod incident;
pub mod layout;
pub mod logging;
pub mod menu;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod splitter;

pub use config::{AggregatorConfig, Source, SourceKind};
pub use error::{AggregatorError, Result};
pub use orchestrator::{Orchestrator, RunStats};
