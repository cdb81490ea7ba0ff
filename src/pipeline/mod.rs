pub mod archive;
pub mod assembler;
pub mod classify;
pub mod extraction;
pub mod import;
pub mod llm;
pub mod processor;
pub mod publish;
pub mod resources;
pub mod stage;

pub use assembler::{ResultAssembler, RunStats};
pub use processor::{IntakeOutput, Pipeline, PipelineError, PipelineOptions};
