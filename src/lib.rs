pub mod config;
pub mod curation;
pub mod discovery;
pub mod error;
pub mod pipeline;
pub mod preprocessing;
pub mod recording;
pub mod sorting;
pub mod utils;
pub mod waveforms;

pub use error::{PipelineError, Result};
