//! Model context-window table and usage accounting.

use crate::journal::event::{ContextInfo, UsageSummary};
use serde_json::Value;

/// Context-window sizes for known model families. Prefix matches, longest
/// first, so `gpt-4o-mini` hits the `gpt-4o` row.
const CONTEXT_WINDOWS: &[(&str, u64)] = &[
    ("gpt-5.2", 200_000),
    ("gpt-4o", 128_000),
    ("o4-mini", 200_000),
    ("o3", 200_000),
];

/// Look up the context window for a model name. `None` when unknown.
pub fn max_tokens_for(model: Option<&str>) -> Option<u64> {
    let model = model?;
    CONTEXT_WINDOWS
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, max)| *max)
}

/// Build the `contextInfo` summary for a finished turn.
///
/// `percentLeft` is clamped at zero; both it and `maxTokens` are `None` when
/// the model has no table entry.
pub fn context_info(model: Option<&str>, total_tokens: u64) -> ContextInfo {
    let max_tokens = max_tokens_for(model);
    #[allow(clippy::cast_precision_loss)]
    let percent_left = max_tokens.map(|max| {
        if max == 0 {
            0.0
        } else {
            (max.saturating_sub(total_tokens)) as f64 / max as f64
        }
    });
    ContextInfo {
        max_tokens,
        used_tokens: total_tokens,
        percent_left,
    }
}

/// Parse the `usage` object from the provider's `turn.completed` record.
///
/// Total is input + output; missing counters read as zero.
pub fn usage_from_value(value: &Value) -> UsageSummary {
    let get = |key: &str| value.get(key).and_then(Value::as_u64).unwrap_or(0);
    let input_tokens = get("input_tokens");
    let cached_input_tokens = get("cached_input_tokens");
    let output_tokens = get("output_tokens");
    UsageSummary {
        input_tokens,
        cached_input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
    }
}
