//! Unified Error Model
use thiserror::Error;

use crate::data_model::ShapeKind;
use crate::stage::StageError;

/// Structural and runtime failures of a reduction stack.
///
/// Composition failures (`BUILD/`, `SHAPE/`, `CAPABILITY/`, `MERGE/`) describe a
/// misassembled pipeline and are never recovered from.
#[derive(Error, Debug)]
pub enum StackError {
    #[error("BUILD/{stage}: no base stage to build on")]
    NullBase { stage: String },

    #[error("BUILD/{stage}: expects a {expected} base but `{base}` consumes {found} units")]
    BaseShapeMismatch {
        stage: String,
        base: String,
        expected: ShapeKind,
        found: ShapeKind,
    },

    #[error("BUILD/{stage} over {base}: {what} mismatch, `{stage}` expects {upper} but `{base}` has {lower}")]
    TypeMismatch {
        stage: String,
        base: String,
        what: &'static str,
        upper: String,
        lower: String,
    },

    #[error("BUILD/{stage}: declares both merge and merge_with_all")]
    DuplicateMerge { stage: String },

    #[error("BUILD/{stage}: declares both finish_example and split finish callbacks")]
    DuplicateFinish { stage: String },

    #[error("BUILD/{stage}: weights_per_example must be at least 1")]
    ZeroMultiplier { stage: String },

    #[error("BUILD/weights: {bits} bits with stride shift {stride_shift} exceed {max} address bits")]
    AddressSpace { bits: u32, stride_shift: u32, max: u32 },

    #[error("SHAPE/{stage}: {expected} stage was handed a {found} unit")]
    ShapeMismatch {
        stage: String,
        expected: ShapeKind,
        found: ShapeKind,
    },

    #[error("SHAPE/{stage}: cannot forward {call} to `{base}`, which consumes {found} units")]
    ShapeCrossing {
        stage: String,
        base: String,
        call: &'static str,
        found: ShapeKind,
    },

    #[error("CAPABILITY/{stage}: no {call} implementation and no base to forward to")]
    CapabilityMissing { stage: String, call: &'static str },

    #[error("CAPABILITY/{stage}: {call} needs a base stage but this stage is terminal")]
    NoBase { stage: String, call: &'static str },

    #[error("MERGE/{stage}: does not implement {op}")]
    AggregationUnsupported { stage: String, op: &'static str },

    #[error("MERGE/depth {depth}: {detail}")]
    StructureMismatch { depth: usize, detail: String },

    #[error("MERGE/{0}")]
    Aggregation(String),

    #[error("PERSIST/{stage}: {source}")]
    Persistence {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error("PERSIST/{0}")]
    ModelFormat(String),

    #[error(transparent)]
    Stage(#[from] StageError),
}

pub type Result<T, E = StackError> = std::result::Result<T, E>;

impl StackError {
    /// Whether the error reports a misassembled stack rather than a data or I/O problem.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            Self::Persistence { .. } | Self::ModelFormat(_) | Self::Stage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_stage() {
        let err = StackError::TypeMismatch {
            stage: "csoaa".into(),
            base: "scorer".into(),
            what: "label",
            upper: "cost_sensitive".into(),
            lower: "simple".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("BUILD/csoaa over scorer"));
        assert!(msg.contains("cost_sensitive"));
        assert!(msg.contains("simple"));
    }

    #[test]
    fn test_structural_classification() {
        let io = StackError::Persistence {
            stage: "linear".into(),
            source: std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
        };
        assert!(!io.is_structural());

        let shape = StackError::ShapeMismatch {
            stage: "each_line".into(),
            expected: ShapeKind::Multi,
            found: ShapeKind::Single,
        };
        assert!(shape.is_structural());
        assert!(shape.to_string().contains("multi-line stage was handed a single-line unit"));
    }
}
