//! Value coercion rules
//!
//! The dynamic value-cleaning logic of the source systems becomes an explicit,
//! ordered rule table evaluated deterministically per column, testable in
//! isolation from the streaming engine. Rule precedence:
//!
//! 1. byte-marker booleans (`b'\x01'` / `b'\x00'` driver encodings)
//! 2. allow-listed boolean columns with 0/1 values
//! 3. nested object/array values serialized to a string
//! 4. timestamp-like columns: in-window epoch integers formatted as
//!    timestamps, out-of-window epochs nulled with a warning
//! 5. everything else passed through unchanged
//!
//! The `*_json` null default is applied separately after resolution, since it
//! triggers on columns that resolved to nothing at all.

use crate::error::Result;
use chrono::DateTime;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{trace, warn};

/// Byte markers some source drivers emit for single-bit flags.
const BYTE_MARKER_TRUE: &str = "b'\\x01'";
const BYTE_MARKER_FALSE: &str = "b'\\x00'";

/// Sane calendar window for epoch values: 1990-01-01 .. 2100-01-01.
const EPOCH_SECS_MIN: i64 = 631_152_000;
const EPOCH_SECS_MAX: i64 = 4_102_444_800;
const EPOCH_MILLIS_MIN: i64 = EPOCH_SECS_MIN * 1000;
const EPOCH_MILLIS_MAX: i64 = EPOCH_SECS_MAX * 1000;

/// Shared coercion context derived from configuration.
pub struct Coercer<'a> {
    boolean_columns: &'a HashSet<String>,
}

struct RuleInput<'v> {
    table: &'v str,
    column: &'v str,
    value: &'v Value,
}

/// One (predicate, transform) pair; first matching rule wins.
struct Rule {
    name: &'static str,
    apply: fn(&Coercer<'_>, &RuleInput<'_>) -> Option<Result<Value>>,
}

const RULES: &[Rule] = &[
    Rule {
        name: "byte_marker_boolean",
        apply: |_, input| match input.value {
            Value::String(s) if s == BYTE_MARKER_TRUE => Some(Ok(Value::Bool(true))),
            Value::String(s) if s == BYTE_MARKER_FALSE => Some(Ok(Value::Bool(false))),
            _ => None,
        },
    },
    Rule {
        name: "allow_listed_boolean",
        apply: |coercer, input| {
            if !coercer.boolean_columns.contains(input.column) {
                return None;
            }
            match input.value {
                Value::Bool(_) => Some(Ok(input.value.clone())),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Some(Ok(Value::Bool(false))),
                    Some(1) => Some(Ok(Value::Bool(true))),
                    _ => None,
                },
                _ => None,
            }
        },
    },
    Rule {
        name: "nested_value_serialized",
        apply: |_, input| match input.value {
            Value::Object(_) | Value::Array(_) => Some(
                serde_json::to_string(input.value)
                    .map(Value::String)
                    .map_err(Into::into),
            ),
            _ => None,
        },
    },
    Rule {
        name: "epoch_timestamp",
        apply: |_, input| {
            if !is_timestamp_column(input.column) {
                return None;
            }
            let epoch = input.value.as_i64()?;
            Some(Ok(coerce_epoch(input.table, input.column, epoch)))
        },
    },
];

impl<'a> Coercer<'a> {
    pub fn new(boolean_columns: &'a HashSet<String>) -> Self {
        Self { boolean_columns }
    }

    /// Coerce one resolved value for `table.column`.
    pub fn coerce(&self, table: &str, column: &str, value: Value) -> Result<Value> {
        let input = RuleInput {
            table,
            column,
            value: &value,
        };
        for rule in RULES {
            if let Some(outcome) = (rule.apply)(self, &input) {
                trace!(rule = rule.name, column, "Coercion rule applied");
                return outcome;
            }
        }
        Ok(value)
    }

    /// Default for a column that resolved to nothing: `*_json` columns get an
    /// empty JSON object literal, everything else stays null.
    pub fn default_for_missing(&self, column: &str) -> Value {
        if column.ends_with("_json") {
            Value::String("{}".to_string())
        } else {
            Value::Null
        }
    }
}

/// Columns treated as timestamp-like for epoch handling.
pub fn is_timestamp_column(column: &str) -> bool {
    column.ends_with("_at") || column.ends_with("_time") || column == "timestamp"
}

fn coerce_epoch(table: &str, column: &str, epoch: i64) -> Value {
    let datetime = if (EPOCH_MILLIS_MIN..EPOCH_MILLIS_MAX).contains(&epoch) {
        DateTime::from_timestamp_millis(epoch)
    } else if (EPOCH_SECS_MIN..EPOCH_SECS_MAX).contains(&epoch) {
        DateTime::from_timestamp(epoch, 0)
    } else {
        None
    };

    match datetime {
        Some(dt) => Value::String(dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        None => {
            warn!(
                table,
                column,
                epoch,
                "Epoch value outside sane calendar window; nulling"
            );
            Value::Null
        },
    }
}
