//! Command neutralization.
//!
//! Attacker commands must survive storage and display without ever being
//! executable or auto-linkable. Intelligent mode classifies the command and
//! rewrites only the dangerous parts with recognizable markers; legacy mode
//! is the original indiscriminate token replacement kept for operators with
//! downstream parsers that expect it.

use serde_json::{json, Value};

use crate::event::sanitize::hash_bytes;

/// How command payload fields are neutralized before storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefangMode {
	/// Classify the command and defang URLs, separators and dangerous verbs
	/// in-place, keeping the text readable for analysts.
	Intelligent,
	/// Replace URLs and separators with opaque tokens (`[URL]`, `[SC]`, ...).
	Legacy,
	/// Leave command fields untouched (test and replay tooling only).
	Off,
}

impl DefangMode {
	pub fn parse(raw: &str) -> Option<Self> {
		match raw.to_ascii_lowercase().as_str() {
			"intelligent" => Some(Self::Intelligent),
			"legacy" => Some(Self::Legacy),
			"off" | "none" => Some(Self::Off),
			_ => None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct DefangConfig {
	pub mode: DefangMode,
	/// Keep the original command under `input_original`. When false the
	/// original fields are blanked and only the hash survives.
	pub preserve_original: bool,
}

impl Default for DefangConfig {
	fn default() -> Self {
		Self {
			mode: DefangMode::Intelligent,
			preserve_original: true,
		}
	}
}

/// Danger classification recorded alongside defanged commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
	Safe,
	Moderate,
	Dangerous,
}

impl CommandClass {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Safe => "safe",
			Self::Moderate => "moderate",
			Self::Dangerous => "dangerous",
		}
	}
}

const DANGEROUS_KEYWORDS: &[&str] = &[
	"curl", "wget", "powershell", "nc", "tftp", "rm ", "mkfs", "dd ", "chmod +x",
];

const MODERATE_PATTERNS: &[&str] = &["/tmp/", "http://", "https://", ";", "&&", "|"];

/// Verb substitutions applied in intelligent mode. Each pair is
/// `(dangerous verb, neutered spelling)`; matching is word-prefix based so
/// `rm -rf` becomes `rx -rf` but `alarm` is untouched.
const VERB_SUBSTITUTIONS: &[(&str, &str)] = &[
	("rm", "rx"),
	("dd", "dx"),
	("mkfs", "mkxs"),
	("chmod", "chxod"),
];

/// Classify a command by the strongest signal present.
pub fn classify_command(command: &str) -> CommandClass {
	let lowered = command.to_lowercase();
	if DANGEROUS_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
		return CommandClass::Dangerous;
	}
	if MODERATE_PATTERNS.iter().any(|p| lowered.contains(p)) {
		return CommandClass::Moderate;
	}
	CommandClass::Safe
}

/// Intelligent defanging: mark URLs, separators and dangerous verbs while
/// keeping the command structure legible.
pub fn defang_command(command: &str) -> String {
	let mut out = command.replace("https://", "hxxps://").replace("http://", "hxxp://");
	out = out.replace("&&", " [AND] ");
	out = out.replace(';', " [SC] ");
	out = out.replace('|', " [PIPE] ");

	let mut words: Vec<String> = Vec::new();
	for word in out.split_whitespace() {
		let mut replaced = None;
		for (verb, substitute) in VERB_SUBSTITUTIONS {
			if word == *verb {
				replaced = Some((*substitute).to_string());
				break;
			}
		}
		words.push(replaced.unwrap_or_else(|| word.to_string()));
	}
	words.join(" ")
}

/// Legacy neutralization: opaque token replacement, collapsed whitespace.
pub fn neutralize_command_legacy(command: &str) -> String {
	let mut sanitized = command.replace("http://", "[URL]").replace("https://", "[URL]");
	sanitized = sanitized.replace(';', " [SC] ");
	sanitized = sanitized.replace("&&", " [AND] ");
	sanitized = sanitized.replace('|', " [PIPE] ");
	sanitized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rewrite the command fields of an event payload in place.
///
/// Always records `input_hash` (BLAKE2b-256 of the original command). In
/// intelligent mode a `command_analysis` object is attached and safe
/// commands are left as-is apart from the hash.
pub fn neutralize_payload(event: &mut Value, config: &DefangConfig) {
	let command = event
		.get("input")
		.or_else(|| event.get("command"))
		.and_then(Value::as_str)
		.map(|s| s.to_string());

	let Some(command) = command else {
		return;
	};
	let Some(map) = event.as_object_mut() else {
		return;
	};

	map.insert("input_hash".to_string(), json!(hash_bytes(command.as_bytes())));

	match config.mode {
		DefangMode::Off => {}
		DefangMode::Legacy => {
			map.insert("input_safe".to_string(), json!(neutralize_command_legacy(&command)));
			blank_or_preserve(map, &command, config.preserve_original);
		}
		DefangMode::Intelligent => {
			let class = classify_command(&command);
			map.insert(
				"command_analysis".to_string(),
				json!({"classification": class.as_str()}),
			);
			if class != CommandClass::Safe {
				map.insert("input_safe".to_string(), json!(defang_command(&command)));
				blank_or_preserve(map, &command, config.preserve_original);
			}
		}
	}
}

fn blank_or_preserve(map: &mut serde_json::Map<String, Value>, command: &str, preserve: bool) {
	if preserve {
		map.insert("input_original".to_string(), json!(command));
	}
	if map.contains_key("input") {
		map.insert("input".to_string(), Value::Null);
	}
	if map.contains_key("command") {
		map.insert("command".to_string(), Value::Null);
	}
}
