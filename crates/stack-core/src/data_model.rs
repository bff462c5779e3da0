//! Data Model: Example, MultiEx, labels, predictions and shape tags
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of label a stage consumes or hands to its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    NoLabel,
    Simple,
    Multiclass,
    CostSensitive,
}

/// Kind of prediction a stage produces or receives from its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionKind {
    NoPred,
    Scalar,
    Scalars,
    Multiclass,
    ActionScores,
}

/// Whether a stage consumes one example or an ordered list of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Single,
    Multi,
}

impl fmt::Display for LabelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::NoLabel => "no_label",
            Self::Simple => "simple",
            Self::Multiclass => "multiclass",
            Self::CostSensitive => "cost_sensitive",
        };
        f.write_str(name)
    }
}

impl fmt::Display for PredictionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::NoPred => "no_pred",
            Self::Scalar => "scalar",
            Self::Scalars => "scalars",
            Self::Multiclass => "multiclass",
            Self::ActionScores => "action_scores",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Single => f.write_str("single-line"),
            Self::Multi => f.write_str("multi-line"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Label {
    #[default]
    None,
    Simple(f32),
    Multiclass(u32),
    /// (class, cost) pairs
    CostSensitive(Vec<(u32, f32)>),
}

impl Label {
    pub fn kind(&self) -> LabelKind {
        match self {
            Self::None => LabelKind::NoLabel,
            Self::Simple(_) => LabelKind::Simple,
            Self::Multiclass(_) => LabelKind::Multiclass,
            Self::CostSensitive(_) => LabelKind::CostSensitive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Prediction {
    #[default]
    None,
    Scalar(f32),
    Scalars(Vec<f32>),
    Multiclass(u32),
    /// (action, score) pairs
    ActionScores(Vec<(u32, f32)>),
}

impl Prediction {
    pub fn kind(&self) -> PredictionKind {
        match self {
            Self::None => PredictionKind::NoPred,
            Self::Scalar(_) => PredictionKind::Scalar,
            Self::Scalars(_) => PredictionKind::Scalars,
            Self::Multiclass(_) => PredictionKind::Multiclass,
            Self::ActionScores(_) => PredictionKind::ActionScores,
        }
    }

    pub fn scalar(&self) -> Option<f32> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Scalar(v) => write!(f, "{}", v),
            Self::Scalars(vs) => {
                let parts: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
                f.write_str(&parts.join(","))
            }
            Self::Multiclass(c) => write!(f, "{}", c),
            Self::ActionScores(pairs) => {
                let parts: Vec<String> = pairs.iter().map(|(a, s)| format!("{}:{}", a, s)).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// One example as seen by the stack. Parsing happens elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Example {
    /// Sparse (feature index, value) pairs, indices already hashed
    pub features: Vec<(u64, f32)>,
    pub label: Label,
    pub prediction: Prediction,
    /// Importance weight
    pub weight: f32,
    /// Accumulated weight offset of the stage currently running
    pub ft_offset: u64,
    pub test_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Loss reported by the terminal stage on the last learn
    #[serde(default)]
    pub loss: f32,
}

impl Example {
    pub fn new(features: Vec<(u64, f32)>, label: Label) -> Self {
        Self {
            features,
            label,
            weight: 1.0,
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn test_only(mut self) -> Self {
        self.test_only = true;
        self
    }

    pub fn is_labeled(&self) -> bool {
        !matches!(self.label, Label::None) && !self.test_only
    }
}

/// Ordered list of examples handled as one logical unit.
pub type MultiEx = Vec<Example>;

/// What the driver hands to the top of the stack.
#[derive(Debug, Clone)]
pub enum ExampleUnit {
    Single(Example),
    Multi(MultiEx),
}

impl ExampleUnit {
    pub fn shape(&self) -> ShapeKind {
        match self {
            Self::Single(_) => ShapeKind::Single,
            Self::Multi(_) => ShapeKind::Multi,
        }
    }

    /// Every example's current offset, in order.
    pub fn offsets(&self) -> Vec<u64> {
        match self {
            Self::Single(ex) => vec![ex.ft_offset],
            Self::Multi(exs) => exs.iter().map(|ex| ex.ft_offset).collect(),
        }
    }
}

impl From<Example> for ExampleUnit {
    fn from(ex: Example) -> Self {
        Self::Single(ex)
    }
}

impl From<MultiEx> for ExampleUnit {
    fn from(exs: MultiEx) -> Self {
        Self::Multi(exs)
    }
}
