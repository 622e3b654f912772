//! Non-finite sample rejection
//!
//! The check is a pure predicate. Callers decide how to log the diagnostic;
//! the pipeline skips rejected examples and keeps reading.

use crate::data::decode::DecodedExample;
use crate::data::error::DataError;
use crate::tensor::Tensor;

/// Why an example was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectDiagnostic {
    pub tensor: &'static str,
    pub first_index: usize,
    pub nan_count: usize,
    pub inf_count: usize,
    pub filename_id: i64,
    pub sample_id: i64,
}

impl RejectDiagnostic {
    pub fn into_error(self) -> DataError {
        DataError::NonFiniteSample {
            tensor: self.tensor,
            index: self.first_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub keep: bool,
    pub diagnostic: Option<RejectDiagnostic>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidityFilter;

impl ValidityFilter {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, example: &DecodedExample) -> Verdict {
        let offending = [("mixture", &example.mixture), ("sources", &example.sources)]
            .into_iter()
            .find_map(|(name, tensor)| Self::inspect(name, tensor));

        match offending {
            None => Verdict {
                keep: true,
                diagnostic: None,
            },
            Some((tensor, first_index, nan_count, inf_count)) => Verdict {
                keep: false,
                diagnostic: Some(RejectDiagnostic {
                    tensor,
                    first_index,
                    nan_count,
                    inf_count,
                    filename_id: example.filename_id,
                    sample_id: example.sample_id,
                }),
            },
        }
    }

    pub fn keep(&self, example: &DecodedExample) -> bool {
        self.check(example).keep
    }

    fn inspect(name: &'static str, tensor: &Tensor) -> Option<(&'static str, usize, usize, usize)> {
        let first = tensor.first_non_finite()?;
        let (nan, inf) = tensor.non_finite_counts();
        Some((name, first, nan, inf))
    }
}
