// Logging utilities
// Structured logging with JSON and human-readable formats

use log::Level;
use serde_json::json;
use std::sync::RwLock;

/// Placeholder written wherever a secret would otherwise appear.
pub const REDACTED: &str = "***";

/// Request id of the invocation currently being handled.
/// The Lambda runtime delivers one event at a time per process, so a single slot is enough.
static CURRENT_REQUEST_ID: RwLock<Option<String>> = RwLock::new(None);

/// Tag subsequent log lines with the given invocation request id (or clear it).
pub fn set_request_id(request_id: Option<String>) {
    if let Ok(mut slot) = CURRENT_REQUEST_ID.write() {
        *slot = request_id;
    }
}

/// Request id of the in-flight invocation, if any.
pub fn current_request_id() -> Option<String> {
    CURRENT_REQUEST_ID.read().ok().and_then(|slot| slot.clone())
}

/// Mask sensitive data in logs
pub fn mask_sensitive(input: &str) -> String {
    if input.len() <= 8 {
        return REDACTED.to_string();
    }

    let visible = 4;
    let start: String = input.chars().take(visible).collect();
    let end: String = {
        let tail: Vec<char> = input.chars().rev().take(visible).collect();
        tail.into_iter().rev().collect()
    };

    format!("{}...{}", start, end)
}

/// Replace every occurrence of each secret in `text` with `***`.
///
/// Empty secrets are skipped (replacing "" would interleave the placeholder between every char).
/// Longer secrets are replaced first so a secret that contains another one is masked whole.
pub fn redact_secrets(text: &str, secrets: &[&str]) -> String {
    let mut ordered: Vec<&str> = secrets.iter().copied().filter(|s| !s.is_empty()).collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));

    let mut out = text.to_string();
    for secret in ordered {
        out = out.replace(secret, REDACTED);
    }
    out
}

/// Parse phase and step from log message
/// Extracts [PHASE: ...] and [STEP: ...] patterns
pub fn parse_log_metadata(message: &str) -> (Option<String>, Option<String>, String) {
    let mut phase = None;
    let mut step = None;
    let mut cleaned_message = message.to_string();

    // Extract [PHASE: ...]
    if let Some(start) = message.find("[PHASE:") {
        if let Some(end) = message[start..].find(']') {
            let phase_str = &message[start + 7..start + end].trim();
            phase = Some(phase_str.to_string());
            cleaned_message = format!("{} {}", &message[..start], &message[start + end + 1..])
                .trim()
                .to_string();
        }
    }

    // Extract [STEP: ...]
    if let Some(start) = cleaned_message.find("[STEP:") {
        if let Some(end) = cleaned_message[start..].find(']') {
            let step_str = &cleaned_message[start + 6..start + end].trim();
            step = Some(step_str.to_string());
            cleaned_message = format!(
                "{} {}",
                &cleaned_message[..start],
                &cleaned_message[start + end + 1..]
            )
            .trim()
            .to_string();
        }
    }

    (phase, step, cleaned_message)
}

/// Format log entry as JSON for structured logging
pub fn format_json_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
    request_id: Option<&str>,
) -> String {
    let mut log_entry = json!({
        "timestamp": timestamp,
        "level": level.as_str(),
        "target": target,
        "message": message,
    });

    if let Some(phase) = phase {
        log_entry["phase"] = json!(phase);
    }

    if let Some(step) = step {
        log_entry["step"] = json!(step);
    }

    if let Some(request_id) = request_id {
        log_entry["requestId"] = json!(request_id);
    }

    serde_json::to_string(&log_entry).unwrap_or_else(|_| "{}".to_string())
}

/// Format log entry as human-readable text
pub fn format_human_readable_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut log_line = format!("[{}] [{}]", timestamp, level.as_str());

    if let Some(phase) = phase {
        log_line.push_str(&format!(" [PHASE: {}]", phase));
    }

    if let Some(step) = step {
        log_line.push_str(&format!(" [STEP: {}]", step));
    }

    log_line.push_str(&format!(" [{}] {}", target, message));
    log_line
}
