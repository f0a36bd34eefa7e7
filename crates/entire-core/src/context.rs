//! Aggregated context documents.
//!
//! Every checkpoint carries a `context.md` summarizing the turn for a
//! later reader: what was asked, what was touched, and what it cost.

use chrono::{DateTime, Utc};

use crate::checkpoint::TokenUsage;
use crate::stringutil::truncate_chars;

/// Maximum codepoints of each prompt reproduced in the context document.
const PROMPT_SNIPPET_CHARS: usize = 200;

/// Inputs for rendering a turn's context document.
pub struct TurnContext<'a> {
    pub session_id: &'a str,
    pub branch: &'a str,
    pub base_commit: &'a str,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub prompts: &'a [String],
    pub files_touched: &'a [String],
    pub token_usage: &'a TokenUsage,
}

/// Render the aggregated context markdown for a turn.
pub fn render(ctx: &TurnContext<'_>) -> String {
    let mut out = String::new();
    out.push_str("# Turn context\n\n");
    out.push_str(&format!("- session: {}\n", ctx.session_id));
    out.push_str(&format!("- branch: {}\n", ctx.branch));
    out.push_str(&format!("- base commit: {}\n", ctx.base_commit));
    out.push_str(&format!(
        "- window: {} → {}\n",
        ctx.started_at.to_rfc3339(),
        ctx.ended_at.to_rfc3339()
    ));

    out.push_str("\n## Prompts\n\n");
    if ctx.prompts.is_empty() {
        out.push_str("(none)\n");
    }
    for prompt in ctx.prompts {
        let snippet = truncate_chars(prompt.trim(), PROMPT_SNIPPET_CHARS, "…");
        out.push_str(&format!("- {snippet}\n"));
    }

    out.push_str("\n## Files touched\n\n");
    if ctx.files_touched.is_empty() {
        out.push_str("(none)\n");
    }
    for file in ctx.files_touched {
        out.push_str(&format!("- `{file}`\n"));
    }

    let u = ctx.token_usage;
    out.push_str("\n## Token usage\n\n");
    out.push_str(&format!(
        "input: {}, output: {}, cache write: {}, cache read: {}, api calls: {}\n",
        u.input_tokens, u.output_tokens, u.cache_creation_tokens, u.cache_read_tokens, u.api_call_count
    ));

    out
}
