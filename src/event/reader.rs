//! Streaming readers for honeypot log files.
//!
//! Input files are JSON-lines text, optionally gzip- or bzip2-compressed
//! (recognized by extension). Each yielded item carries the 0-based line
//! offset used as part of the raw event natural key. Non-JSON lines are
//! preserved as `{"malformed": <raw line>}` so nothing is silently dropped.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use serde_json::{json, Value};

/// Reader configuration shared by both loaders.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
	/// When true, concatenated pretty-printed objects are reassembled across
	/// lines. When false every non-empty line must be a complete document.
	pub multiline_json: bool,
}

impl Default for ReaderConfig {
	fn default() -> Self {
		Self { multiline_json: false }
	}
}

/// Open a log file, transparently decoding gzip/bzip2 by extension.
pub fn open_source(path: &Path) -> Result<Box<dyn BufRead + Send>> {
	let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
	let reader: Box<dyn Read + Send> = match path.extension().and_then(|e| e.to_str()) {
		Some("gz") => Box::new(MultiGzDecoder::new(file)),
		Some("bz2") => Box::new(MultiBzDecoder::new(file)),
		_ => Box::new(file),
	};
	Ok(Box::new(BufReader::new(reader)))
}

/// Lazy `(offset, payload)` stream over one source file.
pub struct EventReader {
	inner: Box<dyn BufRead + Send>,
	config: ReaderConfig,
	offset: i64,
	buffer: Vec<u8>,
	done: bool,
}

impl EventReader {
	pub fn open(path: &Path, config: ReaderConfig) -> Result<Self> {
		Ok(Self {
			inner: open_source(path)?,
			config,
			offset: 0,
			buffer: Vec::new(),
			done: false,
		})
	}

	pub fn from_reader(inner: Box<dyn BufRead + Send>, config: ReaderConfig) -> Self {
		Self {
			inner,
			config,
			offset: 0,
			buffer: Vec::new(),
			done: false,
		}
	}

	/// Read one physical line, replacing invalid UTF-8 rather than failing.
	fn next_line(&mut self) -> std::io::Result<Option<String>> {
		self.buffer.clear();
		let n = self.inner.read_until(b'\n', &mut self.buffer)?;
		if n == 0 {
			return Ok(None);
		}
		Ok(Some(String::from_utf8_lossy(&self.buffer).into_owned()))
	}

	fn parse_line(line: &str) -> Value {
		match serde_json::from_str::<Value>(line) {
			Ok(v) => v,
			Err(_) => json!({"malformed": line}),
		}
	}

	/// Pretty-printed mode: accumulate lines until braces balance outside of
	/// string literals, then parse the assembled document.
	fn next_multiline(&mut self) -> std::io::Result<Option<(i64, Value)>> {
		let mut assembled = String::new();
		let mut depth = 0i64;
		let mut in_string = false;
		let mut escaped = false;
		let start_offset = self.offset;

		loop {
			let Some(line) = self.next_line()? else {
				if assembled.trim().is_empty() {
					return Ok(None);
				}
				let payload = Self::parse_line(assembled.trim());
				return Ok(Some((start_offset, payload)));
			};
			self.offset += 1;
			if assembled.is_empty() && line.trim().is_empty() {
				continue;
			}
			for c in line.chars() {
				if escaped {
					escaped = false;
					continue;
				}
				match c {
					'\\' if in_string => escaped = true,
					'"' => in_string = !in_string,
					'{' if !in_string => depth += 1,
					'}' if !in_string => depth -= 1,
					_ => {}
				}
			}
			assembled.push_str(&line);
			if depth <= 0 && !assembled.trim().is_empty() {
				let payload = Self::parse_line(assembled.trim());
				return Ok(Some((start_offset, payload)));
			}
		}
	}
}

impl Iterator for EventReader {
	type Item = std::io::Result<(i64, Value)>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.done {
			return None;
		}
		if self.config.multiline_json {
			return match self.next_multiline() {
				Ok(Some(item)) => Some(Ok(item)),
				Ok(None) => {
					self.done = true;
					None
				}
				Err(e) => {
					self.done = true;
					Some(Err(e))
				}
			};
		}
		loop {
			match self.next_line() {
				Ok(Some(line)) => {
					let offset = self.offset;
					self.offset += 1;
					let trimmed = line.trim();
					if trimmed.is_empty() {
						continue;
					}
					return Some(Ok((offset, Self::parse_line(trimmed))));
				}
				Ok(None) => {
					self.done = true;
					return None;
				}
				Err(e) => {
					self.done = true;
					return Some(Err(e));
				}
			}
		}
	}
}

/// Stable inode for a source path, if the platform exposes one. Used by the
/// delta loader to detect file rotation.
pub fn source_inode(path: &Path) -> Option<u64> {
	#[cfg(unix)]
	{
		use std::os::unix::fs::MetadataExt;
		std::fs::metadata(path).ok().map(|m| m.ino())
	}
	#[cfg(not(unix))]
	{
		let _ = path;
		None
	}
}
