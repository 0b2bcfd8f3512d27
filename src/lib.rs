pub mod chunker;
pub mod config;
pub mod contract;
pub mod error;
pub mod generation;
pub mod llm;
pub mod pipeline;
pub mod propagate;
pub mod prompts;
pub mod stages;
pub mod state;
pub mod storage;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::PipelineManager;
pub use state::{PipelineState, Stage};
