use thiserror::Error;

use crate::model::Diagnostic;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed report: missing {missing}")]
    MalformedReport { missing: String },
    #[error("no item lines recognised in report ({rejected} line(s) rejected)")]
    NoItemsFound { rejected: usize },
    #[error("no catalog registered for model {model:?}")]
    UnknownModel { model: String },
    #[error("invalid rule options: {0}")]
    InvalidOptions(String),
    #[error("part lookup failed for kit {kit}: {message}")]
    PartLookup { kit: String, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("canon descriptor {0:?} is empty after normalization")]
    EmptyDescriptor(String),
    #[error("canon descriptor {0:?} is declared more than once")]
    DuplicateDescriptor(String),
    #[error("canonical code {0:?} must be upper-case")]
    LowercaseCode(String),
    #[error("invalid canon pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("canon pattern {0:?} must be anchored with ^ and $")]
    UnanchoredPattern(String),
    #[error("canon pattern {0:?} has a capturing template but no samples")]
    UnsampledPattern(String),
    #[error("canon pattern {pattern:?} does not match its sample {sample:?}")]
    SampleMismatch { pattern: String, sample: String },
    #[error("canonical code {code:?} does not normalize to itself (got {got:?})")]
    NotIdempotent { code: String, got: Option<String> },
    #[error("model {0:?} is registered by more than one catalog")]
    DuplicateModel(String),
    #[error("catalog {model:?} declares kit {kit:?} more than once")]
    DuplicateKit { model: String, kit: String },
    #[error("kit {kit:?} in catalog {model:?} covers no canonical codes")]
    EmptyKit { model: String, kit: String },
    #[error("kit {kit:?} in catalog {model:?} has a per-unit quantity of zero")]
    ZeroKitQuantity { model: String, kit: String },
    #[error("{code:?} is covered by both {first:?} and {second:?} in catalog {model:?}")]
    AmbiguousCoverage {
        model: String,
        code: String,
        first: String,
        second: String,
    },
    #[error("kit {kit:?} in catalog {model:?} covers {code:?}, which is not a canonical code")]
    NonCanonicalCoverage {
        model: String,
        kit: String,
        code: String,
    },
    #[error("quantity override names unknown kit {0:?}")]
    UnknownOverrideKit(String),
    #[error("quantity override names {0:?}, which is not a canonical code")]
    NonCanonicalOverride(String),
    #[error("quantity override for {0:?} must be at least 1")]
    ZeroOverride(String),
    #[error("quantity override for {0:?} is declared more than once")]
    DuplicateOverride(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub value: T,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Outcome<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            diagnostics: Vec::new(),
        }
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn into_parts(self) -> (T, Vec<Diagnostic>) {
        (self.value, self.diagnostics)
    }
}
