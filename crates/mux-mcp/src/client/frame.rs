//! Response framing
//!
//! Backends answer a POST either with a bare JSON body or with an SSE-style
//! stream whose `data:` lines carry the JSON message. Which one arrives is
//! not guaranteed per backend, so framing is detected per response. Mismatches
//! are deterministic failures and must never be retried.

use mux_types::{AppError, AppResult};
use serde_json::Value;

/// Decode `data:` payloads from an SSE-formatted body
///
/// Each blank-line-delimited event becomes one payload string; comment lines
/// and unknown fields are ignored.
pub fn decode_sse_events(buf: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in buf.split('\n') {
        let l = line.trim_end_matches('\r');

        if l.is_empty() {
            if !data_lines.is_empty() {
                out.push(data_lines.join("\n"));
                data_lines.clear();
            }
            continue;
        }

        if l.starts_with(':') {
            continue;
        }

        if let Some(rest) = l.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    if !data_lines.is_empty() {
        out.push(data_lines.join("\n"));
    }

    out
}

/// Scan an SSE body for the first `data:` payload that parses as JSON
fn parse_first_json_event(body: &str) -> AppResult<Value> {
    let events = decode_sse_events(body);
    if events.is_empty() {
        return Err(AppError::Framing(
            "event stream carried no data events".to_string(),
        ));
    }

    for event in &events {
        if let Ok(value) = serde_json::from_str::<Value>(event) {
            return Ok(value);
        }
    }

    Err(AppError::Framing(
        "no event in the stream parsed as JSON".to_string(),
    ))
}

/// Parse a response body according to its advertised content type
///
/// An absent content type is treated as JSON, which some minimal servers
/// send. Anything else fails naming the mismatch.
pub fn parse_body(content_type: &str, body: &str) -> AppResult<Value> {
    if content_type.starts_with("application/json") || content_type.is_empty() {
        serde_json::from_str(body)
            .map_err(|e| AppError::Framing(format!("body is not valid JSON: {}", e)))
    } else if content_type.starts_with("text/event-stream") {
        parse_first_json_event(body)
    } else {
        Err(AppError::Framing(format!(
            "unsupported content type '{}'",
            content_type
        )))
    }
}
