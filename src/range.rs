//! Resolution of the command index range a run covers.

use crate::model::RunOptions;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeValidation {
    pub is_valid: bool,
    pub error_message: Option<String>,
    pub resolved_start: usize,
    pub resolved_end: usize,
}

impl RangeValidation {
    fn valid(start: usize, end: usize) -> Self {
        Self {
            is_valid: true,
            error_message: None,
            resolved_start: start,
            resolved_end: end,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error_message: Some(message.into()),
            resolved_start: 1,
            resolved_end: 0,
        }
    }

    /// The 1-based indices to run, if valid.
    pub fn range(&self) -> Option<RangeInclusive<usize>> {
        self.is_valid
            .then_some(self.resolved_start..=self.resolved_end)
    }
}

/// Decide which commands run for `total_commands` imported commands.
///
/// Rules apply in order; the first failing rule decides the message.
pub fn validate(total_commands: usize, options: &RunOptions) -> RangeValidation {
    if total_commands == 0 {
        return RangeValidation::invalid("No commands to run.");
    }
    if options.use_all {
        return RangeValidation::valid(1, total_commands);
    }
    let (Some(start), Some(end)) = (options.start_index, options.end_index) else {
        return RangeValidation::invalid("Start/End index required.");
    };
    if start < 1 || end < 1 {
        return RangeValidation::invalid("Indices must be 1 or greater.");
    }
    let total = i64::try_from(total_commands).unwrap_or(i64::MAX);
    if start > total || end > total {
        return RangeValidation::invalid(format!(
            "Indices must be within command count ({total_commands})."
        ));
    }
    if start > end {
        return RangeValidation::invalid("Start index must be before end index.");
    }
    // Both are within 1..=total_commands here.
    RangeValidation::valid(start as usize, end as usize)
}
