//! Error types for RDM construction, persistence and comparison.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the engine, the store and the comparator.
#[derive(Debug, Error)]
pub enum RdmError {
    /// A row has zero variance, so its correlation with anything is undefined.
    #[error("degenerate input: row {row} has zero variance after rank transform")]
    DegenerateRow { row: usize },

    /// A dissimilarity sequence handed to the comparator is constant or too short.
    #[error("degenerate comparison: {len} dissimilarity entries carry no rank information")]
    DegenerateComparison { len: usize },

    /// Input contains NaN or infinity.
    #[error("non-finite value at row {row}, column {col}")]
    NonFinite { row: usize, col: usize },

    #[error("empty matrix: {rows} rows x {cols} columns")]
    EmptyMatrix { rows: usize, cols: usize },

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("dissimilarity matrix must be square, got {rows} x {cols}")]
    NotSquare { rows: usize, cols: usize },

    #[error("dissimilarity matrix is not symmetric at ({row}, {col})")]
    Asymmetric { row: usize, col: usize },

    #[error("index {index} out of bounds for dimension {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("group labels differ: expected {expected:?}, got {actual:?}")]
    GroupMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("no stored RDM under key '{key}'")]
    StoreNotFound { key: String },

    #[error("invalid store key '{key}'")]
    InvalidKey { key: String },

    #[error("corrupt RDM file {}: {reason}", path.display())]
    CorruptStore { path: PathBuf, reason: String },

    /// Cancellation observed between block pairs.
    #[error("computation aborted after {completed}/{total} block pairs")]
    Aborted { completed: usize, total: usize },

    /// A fatal failure while processing one group, tagged with the group name.
    #[error("group '{group}': {source}")]
    Group {
        group: String,
        #[source]
        source: Box<RdmError>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl RdmError {
    /// Attach a group identity to an error raised while processing that group.
    pub fn in_group(self, group: impl Into<String>) -> Self {
        RdmError::Group {
            group: group.into(),
            source: Box::new(self),
        }
    }
}

/// Result type for RDM operations.
pub type RdmResult<T> = Result<T, RdmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_context_is_rendered() {
        let err = RdmError::DegenerateRow { row: 3 }.in_group("V1");
        let msg = err.to_string();
        assert!(msg.contains("V1"));
        assert!(msg.contains("row 3"));
        assert!(matches!(err, RdmError::Group { ref group, .. } if group == "V1"));
    }
}
