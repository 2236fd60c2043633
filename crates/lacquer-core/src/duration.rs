// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-readable duration parsing (`30s`, `5m`, `1h`) for `timeout` and
//! retry `initial_delay`/`max_delay` fields in the workflow document.

use crate::error::OrchestratorError;
use std::time::Duration;

/// Parses a duration string of the form `<number><unit>` where unit is one of
/// `ms`, `s`, `m`, `h`. A bare number is treated as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, OrchestratorError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::InvalidWorkflow(
            "empty duration string".to_string(),
        ));
    }

    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number_part, unit_part) = trimmed.split_at(split_at);

    let number: f64 = number_part.parse().map_err(|_| {
        OrchestratorError::InvalidWorkflow(format!("invalid duration '{}'", input))
    })?;

    let millis = match unit_part {
        "" | "s" => number * 1000.0,
        "ms" => number,
        "m" => number * 60_000.0,
        "h" => number * 3_600_000.0,
        other => {
            return Err(OrchestratorError::InvalidWorkflow(format!(
                "unknown duration unit '{}' in '{}'",
                other, input
            )))
        }
    };

    Ok(Duration::from_millis(millis.max(0.0) as u64))
}
