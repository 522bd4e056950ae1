//! Risk scoring for honeypot events.
//!
//! The score is a bounded heuristic over the event type and command text.
//! It is intentionally coarse: its only consumers are the quarantine gate
//! and the per-session running maximum.

/// Substrings of an `eventid` that mark it as a command event.
pub const COMMAND_EVENT_HINTS: &[&str] = &["cowrie.command", "command"];

/// Substrings of an `eventid` that mark it as a file transfer.
pub const FILE_EVENT_HINTS: &[&str] = &["file_download", "cowrie.session.file"];

/// Substrings of an `eventid` that mark it as a login attempt.
pub const LOGIN_EVENT_HINTS: &[&str] = &["login", "cowrie.login"];

/// Tooling frequently abused for staging payloads.
const COMMAND_KEYWORDS: &[&str] = &[
	"curl", "wget", "powershell", "dubious", "nc", "bash", "sh", "python", "perl",
];

/// Patterns that indicate download-and-execute or chained commands.
const SUSPICIOUS_PATTERNS: &[&str] = &["/tmp/", "http://", "https://", ";", "&&", "|"];

/// Score an event in `[0, 100]`.
///
/// - +20 when the `eventid` carries a command hint
/// - +40 when the command text mentions staging tooling
/// - +25 when the command text matches a suspicious pattern
/// - +30 for `cowrie.session.file_download`
pub fn score_event(event_type: Option<&str>, command: Option<&str>) -> i64 {
	let mut score = 0i64;

	if let Some(eventid) = event_type {
		if COMMAND_EVENT_HINTS.iter().any(|hint| eventid.contains(hint)) {
			score += 20;
		}
		if eventid == "cowrie.session.file_download" {
			score += 30;
		}
	}

	if let Some(command) = command {
		let lowered = command.to_lowercase();
		if COMMAND_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
			score += 40;
		}
		if SUSPICIOUS_PATTERNS.iter().any(|p| lowered.contains(p)) {
			score += 25;
		}
	}

	score.min(100)
}

/// True when the `eventid` looks like a command event.
pub fn is_command_event(event_type: &str) -> bool {
	COMMAND_EVENT_HINTS.iter().any(|hint| event_type.contains(hint))
}

/// True when the `eventid` looks like a file transfer.
pub fn is_file_event(event_type: &str) -> bool {
	FILE_EVENT_HINTS.iter().any(|hint| event_type.contains(hint))
}

/// True when the `eventid` looks like a login attempt.
pub fn is_login_event(event_type: &str) -> bool {
	LOGIN_EVENT_HINTS.iter().any(|hint| event_type.contains(hint))
}
