//! Identifier formats shared across the gateway.
//!
//! Event, session, and uniform-request ids are all of the shape
//! `<prefix>_<unixMillis>_<4 random base36 chars>` (§6 "Event id format",
//! "Proxy context `_meta`"); the helpers here are the single place that
//! knows how to mint and split them so the format cannot drift between
//! crates.

use std::time::{SystemTime, UNIX_EPOCH};

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Current time in Unix milliseconds.
#[must_use]
pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Four random lowercase base36 characters, used as the tail of
/// event/session/uniform-request ids.
#[must_use]
pub fn random_suffix() -> String {
    (0..4)
        .map(|_| {
            let idx = fastrand::usize(..BASE36_ALPHABET.len());
            BASE36_ALPHABET[idx] as char
        })
        .collect()
}

/// Allocates a 128-bit-entropy session id (§3 invariant: "the session id
/// must be opaque (>=128 bits of entropy)"). Rendered as 32 lowercase hex
/// characters so it composes cleanly with `streamId` prefixing rules.
#[must_use]
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    fastrand::fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Builds an event id `<streamId>_<unixMillis>_<4 base36 chars>`.
///
/// `streamId` MUST NOT contain `_`; callers use `sessionId` as the stream
/// id, and session ids are hex so this always holds.
#[must_use]
pub fn new_event_id(stream_id: &str) -> String {
    format!("{stream_id}_{}_{}", now_millis(), random_suffix())
}

/// Builds a uniform request id `<sessionId>_<unixMillis>_<4 base36 chars>`
/// used to correlate log records and reverse requests (§6, §4.3).
#[must_use]
pub fn new_uniform_request_id(session_id: &str) -> String {
    format!("{session_id}_{}_{}", now_millis(), random_suffix())
}

/// Builds the `proxyRequestId` carried in `_meta`:
/// `<sessionId>:<originalRequestId>:<unixMs>` (§6).
#[must_use]
pub fn new_proxy_request_id(session_id: &str, original_request_id: &str) -> String {
    format!("{session_id}:{original_request_id}:{}", now_millis())
}

/// Parsed components of an event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEventId {
    pub stream_id: String,
    pub created_at_millis: u128,
    pub suffix: String,
}

/// Splits an event id into `(streamId, createdAtMillis, suffix)`.
///
/// The stream id is everything before the *first* `_`; the millis and
/// suffix are the next two `_`-separated fields. Returns `None` if the id
/// does not have the expected three-field shape.
#[must_use]
pub fn parse_event_id(event_id: &str) -> Option<ParsedEventId> {
    let mut parts = event_id.splitn(3, '_');
    let stream_id = parts.next()?.to_string();
    let ts = parts.next()?;
    let suffix = parts.next()?.to_string();
    let created_at_millis = ts.parse().ok()?;
    Some(ParsedEventId {
        stream_id,
        created_at_millis,
        suffix,
    })
}

/// Extracts just the stream id prefix of an event id (before the first
/// `_`), used by `replayAfter` to locate the stream even when the rest of
/// the id cannot be parsed.
#[must_use]
pub fn stream_id_of(event_id: &str) -> &str {
    event_id.split('_').next().unwrap_or(event_id)
}

/// Extracts the `sessionId` prefix of a `proxyRequestId`
/// (`<sessionId>:<originalRequestId>:<unixMs>`), used to route a reverse
/// request back to the client session that owns the forward call it
/// nests under.
#[must_use]
pub fn proxy_request_session_id(proxy_request_id: &str) -> Option<&str> {
    proxy_request_id.split(':').next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_round_trips() {
        let id = new_event_id("session123");
        let parsed = parse_event_id(&id).expect("parses");
        assert_eq!(parsed.stream_id, "session123");
        assert_eq!(parsed.suffix.len(), 4);
    }

    #[test]
    fn stream_id_of_stops_at_first_underscore() {
        assert_eq!(stream_id_of("abc_1000_wxyz"), "abc");
    }

    #[test]
    fn proxy_request_session_id_stops_at_first_colon() {
        let id = new_proxy_request_id("sess1", "42");
        assert_eq!(proxy_request_session_id(&id), Some("sess1"));
    }

    #[test]
    fn event_ids_are_monotone_within_a_stream() {
        let a = new_event_id("s1");
        let b = new_event_id("s1");
        let pa = parse_event_id(&a).unwrap();
        let pb = parse_event_id(&b).unwrap();
        assert!(pb.created_at_millis >= pa.created_at_millis);
    }
}
