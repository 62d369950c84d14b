//! Push-style RFC 5322 header scanner plus a minimal MIME multipart splitter
//! (the "parser bridge" half of component C5).
//!
//! Grounded on `sin::imap::Stream::chunk`'s needle-finding technique
//! (`memchr::memmem` over a growable buffer) and `sin::imap::utf7_to_utf8`'s
//! `encoding_rs` decoder usage. The wire-level RFC 5322/MIME grammar itself is an
//! explicit external collaborator per spec.md §1 ("consumed as a push parser with
//! a handler interface"); this is that handler, applied once per message and
//! cached by `MessageContext`, not a general-purpose MIME library.

use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
  /// Case-preserved header name, value, in document order (duplicates kept).
  pub headers: Vec<(String, String)>,
  pub headers_text: String,
  pub body_text: String,
  pub sent_date: Option<DateTime<FixedOffset>>,
  pub content_type: Option<String>,
  pub message_id: Option<String>,
}

impl ParsedMessage {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
    self
      .headers
      .iter()
      .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  memchr::memmem::find(haystack, needle)
}

/// Splits `bytes` into a raw header block and the remaining body, at the first
/// blank line. Accepts both CRLF and lenient bare-LF blank lines.
fn split_headers(bytes: &[u8]) -> (&[u8], &[u8]) {
  if let Some(pos) = find(bytes, b"\r\n\r\n") {
    return (&bytes[..pos], &bytes[pos + 4..]);
  }
  if let Some(pos) = find(bytes, b"\n\n") {
    return (&bytes[..pos], &bytes[pos + 2..]);
  }
  (bytes, &[])
}

/// Unfolds and splits a raw header block into (name, value) pairs, preserving
/// order and duplicates.
fn parse_headers(raw: &[u8]) -> Vec<(String, String)> {
  let text = String::from_utf8_lossy(raw);
  let mut headers = Vec::new();
  for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
    if line.starts_with(' ') || line.starts_with('\t') {
      if let Some((_, value)) = headers.last_mut() as Option<&mut (String, String)> {
        // Unfold: a continuation line is appended with a single space.
        let value: &mut String = value;
        value.push(' ');
        value.push_str(line.trim());
      }
      continue;
    }
    if line.trim().is_empty() {
      continue;
    }
    if let Some((name, value)) = line.split_once(':') {
      headers.push((name.trim().to_string(), value.trim().to_string()));
    }
  }
  headers
}

fn headers_text(headers: &[(String, String)]) -> String {
  let mut text = String::new();
  for (name, value) in headers {
    text.push_str(name);
    text.push_str(": ");
    text.push_str(value);
    text.push_str("\r\n");
  }
  text.push_str("\r\n");
  text
}

fn parse_params(value: &str) -> HashMap<String, String> {
  let mut params = HashMap::new();
  for segment in value.split(';').skip(1) {
    if let Some((key, value)) = segment.split_once('=') {
      let value = value.trim().trim_matches('"');
      params.insert(key.trim().to_ascii_lowercase(), value.to_string());
    }
  }
  params
}

fn decode_latin1(bytes: &[u8]) -> String {
  bytes.iter().map(|&b| b as char).collect()
}

fn decode_charset(bytes: &[u8], charset: Option<&str>) -> String {
  let label = charset.unwrap_or("ISO-8859-1");
  if label.eq_ignore_ascii_case("ISO-8859-1") || label.eq_ignore_ascii_case("us-ascii") {
    return decode_latin1(bytes);
  }
  match encoding_rs::Encoding::for_label(label.as_bytes()) {
    Some(encoding) => encoding.decode(bytes).0.into_owned(),
    None => decode_latin1(bytes),
  }
}

/// Minimal, non-streaming base64 decoder sufficient for
/// `Content-Transfer-Encoding: base64` bodies; ignores invalid characters
/// (line breaks, stray CR) rather than erroring, matching real-world MTA
/// leniency.
fn decode_base64(text: &str) -> Vec<u8> {
  fn value(byte: u8) -> Option<u8> {
    match byte {
      b'A'..=b'Z' => Some(byte - b'A'),
      b'a'..=b'z' => Some(byte - b'a' + 26),
      b'0'..=b'9' => Some(byte - b'0' + 52),
      b'+' => Some(62),
      b'/' => Some(63),
      _ => None,
    }
  }
  let mut out = Vec::with_capacity(text.len() / 4 * 3);
  let mut buffer = 0u32;
  let mut bits = 0u32;
  for byte in text.bytes() {
    if byte == b'=' {
      break;
    }
    let Some(v) = value(byte) else { continue };
    buffer = (buffer << 6) | v as u32;
    bits += 6;
    if bits >= 8 {
      bits -= 8;
      out.push((buffer >> bits) as u8);
    }
  }
  out
}

fn decode_quoted_printable(text: &str) -> Vec<u8> {
  let bytes = text.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    match bytes[i] {
      b'=' if i + 2 < bytes.len() && bytes[i + 1] == b'\r' && bytes[i + 2] == b'\n' => i += 3,
      b'=' if i + 1 < bytes.len() && bytes[i + 1] == b'\n' => i += 2,
      b'=' if i + 2 < bytes.len() => {
        let hi = (bytes[i + 1] as char).to_digit(16);
        let lo = (bytes[i + 2] as char).to_digit(16);
        match (hi, lo) {
          (Some(hi), Some(lo)) => {
            out.push((hi * 16 + lo) as u8);
            i += 3;
          }
          _ => {
            out.push(bytes[i]);
            i += 1;
          }
        }
      }
      byte => {
        out.push(byte);
        i += 1;
      }
    }
  }
  out
}

fn decode_transfer_encoding(body: &[u8], encoding: Option<&str>) -> Vec<u8> {
  match encoding.map(|e| e.to_ascii_lowercase()) {
    Some(ref e) if e == "base64" => decode_base64(&String::from_utf8_lossy(body)),
    Some(ref e) if e == "quoted-printable" => decode_quoted_printable(&String::from_utf8_lossy(body)),
    _ => body.to_vec(),
  }
}

/// Recursively collects the decoded text of every `text/*` leaf part.
fn collect_text(bytes: &[u8], out: &mut String) {
  let (raw_headers, body) = split_headers(bytes);
  let headers = parse_headers(raw_headers);
  let lookup = |name: &str| -> Option<&str> {
    headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  };
  let content_type = lookup("Content-Type").unwrap_or("text/plain");
  let params = parse_params(content_type);
  let media_type = content_type
    .split(';')
    .next()
    .unwrap_or("text/plain")
    .trim()
    .to_ascii_lowercase();

  if let Some(boundary) = params.get("boundary") {
    let delimiter = format!("--{boundary}");
    let mut rest = body;
    // Skip preamble up to the first boundary line.
    if let Some(pos) = find(rest, delimiter.as_bytes()) {
      rest = &rest[pos + delimiter.len()..];
    }
    loop {
      let Some(pos) = find(rest, delimiter.as_bytes()) else { break };
      let part = &rest[..pos.saturating_sub(2).min(rest.len())];
      if !part.trim_ascii().is_empty() {
        collect_text(part, out);
      }
      rest = &rest[pos + delimiter.len()..];
      if rest.starts_with(b"--") {
        break;
      }
    }
    return;
  }

  if media_type.starts_with("text/") {
    let encoding = lookup("Content-Transfer-Encoding");
    let decoded = decode_transfer_encoding(body, encoding);
    out.push_str(&decode_charset(&decoded, params.get("charset").map(String::as_str)));
  }
}

/// Runs the full push-parse pass once; `MessageContext` calls this at most once
/// per message and caches the result (spec.md §4.5's lazy parse protocol).
pub fn parse(bytes: &[u8]) -> ParsedMessage {
  let (raw_headers, body) = split_headers(bytes);
  let headers = parse_headers(raw_headers);
  let headers_text = headers_text(&headers);

  let lookup = |name: &str| -> Option<&str> {
    headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  };
  let content_type = lookup("Content-Type").map(str::to_string);
  let message_id = lookup("Message-ID").map(|v| v.trim_matches(|c| c == '<' || c == '>').to_string());
  let sent_date = lookup("Date").and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok());

  let mut body_text = String::new();
  collect_text(bytes, &mut body_text);

  ParsedMessage {
    headers,
    headers_text,
    body_text,
    sent_date,
    content_type,
    message_id,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_simple_plain_text_message() {
    let raw = b"From: a@example.com\r\nSubject: hi\r\nDate: Mon, 1 Jan 2024 10:00:00 +0000\r\n\r\nhello world\r\n";
    let parsed = parse(raw);
    assert_eq!(Some("a@example.com"), parsed.header("From"));
    assert_eq!(Some("hi"), parsed.header("Subject"));
    assert!(parsed.body_text.contains("hello world"));
    assert!(parsed.sent_date.is_some());
  }

  #[test]
  fn unfolds_continuation_lines() {
    let raw = b"Subject: hello\r\n world\r\n\r\nbody";
    let parsed = parse(raw);
    assert_eq!(Some("hello world"), parsed.header("Subject"));
  }

  #[test]
  fn decodes_quoted_printable_latin1_by_default() {
    let raw = b"Content-Type: text/plain\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\ncaf=E9";
    let parsed = parse(raw);
    assert_eq!("caf\u{e9}", parsed.body_text);
  }

  #[test]
  fn decodes_charset_when_declared() {
    let raw = [
      b"Content-Type: text/plain; charset=UTF-8\r\n\r\n".to_vec(),
      "caf\u{e9}".as_bytes().to_vec(),
    ]
    .concat();
    let parsed = parse(&raw);
    assert_eq!("caf\u{e9}", parsed.body_text);
  }

  #[test]
  fn collects_text_parts_of_a_multipart_message() {
    let raw = b"Content-Type: multipart/mixed; boundary=X\r\n\r\n--X\r\nContent-Type: text/plain\r\n\r\npart one\r\n--X\r\nContent-Type: application/octet-stream\r\n\r\nbinary junk\r\n--X--\r\n";
    let parsed = parse(raw);
    assert!(parsed.body_text.contains("part one"));
    assert!(!parsed.body_text.contains("binary junk"));
  }

  #[test]
  fn skips_unavailable_sent_date() {
    let raw = b"Subject: no date\r\n\r\nbody";
    let parsed = parse(raw);
    assert_eq!(None, parsed.sent_date);
  }
}
