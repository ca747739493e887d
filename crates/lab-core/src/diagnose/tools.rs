//! One-line summaries of tool invocations seen during a turn.

use crate::text::{is_blank, truncate_with_ellipsis};
use serde_json::Value;

/// Commands longer than this are clipped in summaries.
pub const COMMAND_SUMMARY_CHARS: usize = 120;

/// Renders a short summary of a finished tool call from its buffered JSON
/// input. Unknown tools and unparsable input yield `"<name> complete"`.
pub fn summarize_tool(name: &str, input: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(input) else {
        return format!("{name} complete");
    };

    let field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| value.get(*k).and_then(Value::as_str))
            .filter(|s| !is_blank(s))
            .map(str::to_string)
    };

    let detail = match name {
        "Bash" => field(&["command"]).map(|c| truncate_with_ellipsis(&c, COMMAND_SUMMARY_CHARS)),
        "Read" | "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => {
            field(&["file_path", "path", "notebook_path"])
        }
        "Grep" | "Glob" => field(&["pattern"]),
        "WebFetch" => field(&["url"]),
        _ => None,
    };

    match detail {
        Some(detail) => format!("{name}: {detail}"),
        None => format!("{name} complete"),
    }
}
