use lab_proto::LogLine;
use std::fmt::Write;

/// Builds the first prompt of a diagnosis session from the service name and
/// its most recent log lines.
pub fn initial_prompt(service: &str, recent: &[LogLine]) -> String {
    let mut prompt = format!(
        "The service `{service}` in my local development stack is misbehaving. \
         Diagnose the most likely root cause and suggest a concrete fix. \
         Inspect the code and configuration as needed.\n\n"
    );

    if recent.is_empty() {
        prompt.push_str("No recent log output was captured for this service.\n");
        return prompt;
    }

    let _ = writeln!(prompt, "Recent log output ({} lines):", recent.len());
    prompt.push_str("```\n");
    for line in recent {
        let _ = writeln!(
            prompt,
            "{} [{}] {}",
            line.timestamp.format("%H:%M:%S"),
            line.level,
            line.message
        );
    }
    prompt.push_str("```\n");
    prompt
}
