pub mod config;
pub mod models;
pub mod pipeline;

pub use config::IntakeConfig;
pub use models::{ExtractedRecord, FileInput};
pub use pipeline::processor::{IntakeOutput, Pipeline, PipelineError, PipelineOptions};

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` wins over the built-in filter.
/// Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_tracing_is_idempotent() {
        super::init_tracing();
        super::init_tracing();
        tracing::info!(version = crate::config::APP_VERSION, "medintake ready");
    }
}
