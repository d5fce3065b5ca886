use thiserror::Error;

/// Fatal error taxonomy of the analysis pipeline.
///
/// Only fatal conditions surface here; recoverable local failures
/// (an unclassifiable atom, a non-orthogonal transition matrix, an
/// un-closable trial circuit) are absorbed where they occur and show up
/// only as missing outputs.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Zero atoms, non-positive cell volume, or a degenerate cell basis.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A periodic axis is thinner than twice the required cutoff.
    #[error("simulation cell is too small along the {axis} axis: half-width {half_width:.4} < cutoff {cutoff:.4}")]
    CellTooSmall {
        axis: char,
        half_width: f64,
        cutoff: f64,
    },

    /// An out-of-range numeric option, rejected before any work begins.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AnalysisError {
    /// Taxonomy class name, stable for reporting.
    pub fn class(&self) -> &'static str {
        match self {
            AnalysisError::InvalidInput(_) => "InvalidInput",
            AnalysisError::CellTooSmall { .. } => "CellTooSmall",
            AnalysisError::Configuration(_) => "ConfigurationError",
        }
    }
}
