//! Pipeline failure taxonomy.
//!
//! Inside the crate every step returns [`anyhow::Result`] with context; the
//! pipeline maps each stage's failure onto one [`PipelineError`] variant so the
//! caller can tell which step stopped the run.

use std::path::PathBuf;

use thiserror::Error;

/// Boxed cause carried by every variant; built from an [`anyhow::Error`] so the
/// full context chain survives.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pretrained model could not be acquired or loaded.
    #[error("Error loading model from {source_name}")]
    Load {
        source_name: String,
        #[source]
        source: Cause,
    },

    /// Loading succeeded but generating the waveform failed.
    #[error("Synthesis failed")]
    Synthesis(#[source] Cause),

    /// The waveform could not be written to `path`.
    #[error("Cannot write output {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: Cause,
    },
}

impl PipelineError {
    /// Short stage name, used in log lines.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Load { .. } => "load",
            PipelineError::Synthesis(_) => "synthesis",
            PipelineError::Write { .. } => "write",
        }
    }
}
