//! Vendor usage-accounting quirks.
//!
//! Each quirk is one named function applied at exactly one pipeline stage.
//! The tests pin the vendor's current numbers so a fixed vendor API shows up
//! as a failing test and the quirk can be retired.

use crate::types::TokenUsage;

/// Gemini/Vertex report `candidatesTokenCount` without the thinking, audio and
/// image output sub-counts. Fold them into `completion_tokens` and recompute
/// the total.
///
/// Not idempotent: call once per response (the non-streaming parser) or once
/// per stream (on the terminal usage chunk).
pub fn fold_completion_details(usage: &mut TokenUsage) {
    let Some(details) = usage.completion_tokens_details.as_ref() else {
        return;
    };
    let extra = details.reasoning_tokens.unwrap_or(0)
        + details.audio_tokens.unwrap_or(0)
        + details.image_tokens.unwrap_or(0);
    if extra == 0 {
        return;
    }
    usage.completion_tokens += extra;
    usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
}
