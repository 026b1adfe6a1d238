//! The Event Log - append-only, bounded, cursor-addressed room history.
//!
//! Pollers (human clients reconnecting, autonomous agents on the HTTP
//! facade) read the log incrementally with [`EventLog::get_since`]. The log
//! is bounded two ways:
//! - a size cap, enforced on every append (oldest entry evicted)
//! - an age-based retention window, enforced by [`EventLog::cleanup`] on a
//!   slower timer outside the tick hot path
//!
//! Eviction is silent. A poller whose cursor fell off the tail gets
//! `cursor_expired = true` and must resynchronize from a full world view.

use roomsim_env::RoomId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Configuration for an event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Maximum number of retained envelopes (default: 10 000)
    pub max_events: usize,

    /// Entries older than this are removed by `cleanup` (default: 1 hour)
    pub retention_ms: u64,

    /// How often the room loop runs `cleanup` (default: 60 s)
    pub cleanup_interval_ms: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            retention_ms: 60 * 60 * 1000,
            cleanup_interval_ms: 60 * 1000,
        }
    }
}

/// Event type tag carried by every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    PresenceJoin,
    PresenceLeave,
    ZoneEnter,
    ZoneExit,
    ProximityEnter,
    ProximityExit,
    ChatMessage,
    AbilityCast,
    AbilityResolved,
    AbilityCancelled,
    AbilityFailed,
    EffectApplied,
    EffectExpired,
    /// Any tag emitted by an outer layer (meetings, objects, ...)
    Custom(String),
}

impl EventType {
    /// Returns the wire tag, e.g. `zone.enter`.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::PresenceJoin => "presence.join",
            EventType::PresenceLeave => "presence.leave",
            EventType::ZoneEnter => "zone.enter",
            EventType::ZoneExit => "zone.exit",
            EventType::ProximityEnter => "proximity.enter",
            EventType::ProximityExit => "proximity.exit",
            EventType::ChatMessage => "chat.message",
            EventType::AbilityCast => "ability.cast",
            EventType::AbilityResolved => "ability.resolved",
            EventType::AbilityCancelled => "ability.cancelled",
            EventType::AbilityFailed => "ability.failed",
            EventType::EffectApplied => "effect.applied",
            EventType::EffectExpired => "effect.expired",
            EventType::Custom(tag) => tag,
        }
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "presence.join" => EventType::PresenceJoin,
            "presence.leave" => EventType::PresenceLeave,
            "zone.enter" => EventType::ZoneEnter,
            "zone.exit" => EventType::ZoneExit,
            "proximity.enter" => EventType::ProximityEnter,
            "proximity.exit" => EventType::ProximityExit,
            "chat.message" => EventType::ChatMessage,
            "ability.cast" => EventType::AbilityCast,
            "ability.resolved" => EventType::AbilityResolved,
            "ability.cancelled" => EventType::AbilityCancelled,
            "ability.failed" => EventType::AbilityFailed,
            "effect.applied" => EventType::EffectApplied,
            "effect.expired" => EventType::EffectExpired,
            _ => EventType::Custom(tag),
        }
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Custom(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque, strictly increasing position in the log.
///
/// Rendered as `c_<n>`. Sequence numbers start at 1, so `c_0` means
/// "before the first event ever appended".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EventCursor(u64);

impl EventCursor {
    /// The cursor preceding every event.
    pub const ORIGIN: EventCursor = EventCursor(0);

    pub fn from_seq(seq: u64) -> Self {
        Self(seq)
    }

    pub fn seq(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c_{}", self.0)
    }
}

/// Error parsing a cursor string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed cursor: {0:?}")]
pub struct CursorParseError(pub String);

impl FromStr for EventCursor {
    type Err = CursorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("c_")
            .and_then(|n| n.parse::<u64>().ok())
            .map(EventCursor)
            .ok_or_else(|| CursorParseError(s.to_string()))
    }
}

impl TryFrom<String> for EventCursor {
    type Error = CursorParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EventCursor> for String {
    fn from(cursor: EventCursor) -> Self {
        cursor.to_string()
    }
}

/// A single immutable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub cursor: EventCursor,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub room_id: RoomId,

    /// Unix epoch milliseconds
    pub timestamp: u64,

    pub payload: serde_json::Value,
}

/// One page returned by [`EventLog::get_since`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<EventEnvelope>,

    /// Pass this back on the next poll
    pub next_cursor: EventCursor,

    /// The requested cursor pointed at history that has been evicted
    pub cursor_expired: bool,

    /// More events are available after `next_cursor`
    pub has_more: bool,
}

/// Append-only, bounded event history.
#[derive(Debug, Clone)]
pub struct EventLog {
    config: EventLogConfig,
    entries: VecDeque<EventEnvelope>,
    next_seq: u64,
    evicted_total: u64,
}

impl EventLog {
    pub fn new(config: EventLogConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            next_seq: 1,
            evicted_total: 0,
        }
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    /// Appends an envelope and returns its cursor.
    ///
    /// If the size cap is exceeded the oldest entry is evicted.
    pub fn append(
        &mut self,
        event_type: EventType,
        room_id: RoomId,
        payload: serde_json::Value,
        timestamp_ms: u64,
    ) -> EventCursor {
        let cursor = EventCursor(self.next_seq);
        self.next_seq += 1;

        self.entries.push_back(EventEnvelope {
            cursor,
            event_type,
            room_id,
            timestamp: timestamp_ms,
            payload,
        });

        while self.entries.len() > self.config.max_events.max(1) {
            self.entries.pop_front();
            self.evicted_total += 1;
        }

        cursor
    }

    /// Returns up to `limit` envelopes strictly after `cursor`.
    ///
    /// `None` reads from the oldest retained entry. A cursor whose successor
    /// was evicted, or one beyond the head (issued by an earlier
    /// incarnation of the room), is reported as expired; the page then
    /// resumes from the oldest retained entry or the head respectively.
    pub fn get_since(&self, cursor: Option<EventCursor>, limit: usize) -> EventPage {
        let head = self.next_seq - 1;
        let first_retained = self.first_retained_seq();

        let (after, cursor_expired) = match cursor {
            None => (first_retained - 1, false),
            Some(c) if c.0 > head => (head, true),
            Some(c) if c.0 + 1 < first_retained => (first_retained - 1, true),
            Some(c) => (c.0, false),
        };

        let skip = (after + 1 - first_retained) as usize;
        let events: Vec<EventEnvelope> = self
            .entries
            .iter()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect();

        let next_cursor = events
            .last()
            .map(|e| e.cursor)
            .unwrap_or(EventCursor(after));
        let has_more = next_cursor.0 < head;

        EventPage {
            events,
            next_cursor,
            cursor_expired,
            has_more,
        }
    }

    /// Like [`get_since`](Self::get_since) but takes the opaque string form
    /// handed to pollers. An unparseable cursor is treated as expired.
    pub fn get_since_str(&self, cursor: Option<&str>, limit: usize) -> EventPage {
        match cursor.map(str::parse::<EventCursor>) {
            None => self.get_since(None, limit),
            Some(Ok(c)) => self.get_since(Some(c), limit),
            Some(Err(e)) => {
                debug!(error = %e, "treating malformed cursor as expired");
                let mut page = self.get_since(None, limit);
                page.cursor_expired = true;
                page
            }
        }
    }

    /// Removes entries older than the retention window.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&mut self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.config.retention_ms);
        let mut removed = 0;
        while self
            .entries
            .front()
            .is_some_and(|e| e.timestamp < cutoff)
        {
            self.entries.pop_front();
            removed += 1;
        }
        self.evicted_total += removed as u64;
        if removed > 0 {
            debug!(removed, retained = self.entries.len(), "event log cleanup");
        }
        removed
    }

    /// Cursor of the newest event (`c_0` when nothing was ever appended).
    pub fn head_cursor(&self) -> EventCursor {
        EventCursor(self.next_seq - 1)
    }

    /// Cursor of the oldest retained event.
    pub fn oldest_cursor(&self) -> Option<EventCursor> {
        self.entries.front().map(|e| e.cursor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total envelopes ever appended.
    pub fn total_appended(&self) -> u64 {
        self.next_seq - 1
    }

    /// Total envelopes removed by the size cap or retention.
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventEnvelope> {
        self.entries.iter()
    }

    fn first_retained_seq(&self) -> u64 {
        self.entries
            .front()
            .map(|e| e.cursor.0)
            .unwrap_or(self.next_seq)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(EventLogConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn small_log(max_events: usize) -> EventLog {
        EventLog::new(EventLogConfig {
            max_events,
            retention_ms: 10_000,
            cleanup_interval_ms: 1_000,
        })
    }

    #[test]
    fn test_cursor_format_roundtrip() {
        let c = EventCursor::from_seq(42);
        assert_eq!(c.to_string(), "c_42");
        assert_eq!("c_42".parse::<EventCursor>().unwrap(), c);
        assert!("42".parse::<EventCursor>().is_err());
        assert!("c_x".parse::<EventCursor>().is_err());
    }

    #[test]
    fn test_append_assigns_increasing_cursors() {
        let mut log = small_log(100);
        let room = RoomId::from_seed(1);
        let a = log.append(EventType::ChatMessage, room, json!({"text": "hi"}), 1);
        let b = log.append(EventType::ChatMessage, room, json!({"text": "yo"}), 2);
        assert!(a < b);
        assert_eq!(log.head_cursor(), b);
        assert_eq!(log.total_appended(), 2);
    }

    #[test]
    fn test_get_since_pages_strictly_after_cursor() {
        let mut log = small_log(100);
        let room = RoomId::from_seed(1);
        for i in 0..5 {
            log.append(EventType::ChatMessage, room, json!({ "i": i }), i);
        }

        let page = log.get_since(None, 2);
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].payload["i"], 0);
        assert!(page.has_more);
        assert!(!page.cursor_expired);

        let page = log.get_since(Some(page.next_cursor), 10);
        assert_eq!(page.events.len(), 3);
        assert_eq!(page.events[0].payload["i"], 2);
        assert!(!page.has_more);

        let page = log.get_since(Some(page.next_cursor), 10);
        assert!(page.events.is_empty());
        assert_eq!(page.next_cursor, log.head_cursor());
    }

    #[test]
    fn test_size_cap_evicts_oldest_and_flags_expired_cursor() {
        let mut log = small_log(3);
        let room = RoomId::from_seed(1);
        let first = log.append(EventType::ZoneEnter, room, json!({}), 0);
        for t in 1..5 {
            log.append(EventType::ZoneEnter, room, json!({}), t);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.evicted_total(), 2);

        let page = log.get_since(Some(first), 10);
        assert!(page.cursor_expired);
        assert_eq!(page.events.len(), 3);
        assert_eq!(page.events[0].cursor, log.oldest_cursor().unwrap());
    }

    #[test]
    fn test_cursor_just_before_oldest_is_not_expired() {
        let mut log = small_log(3);
        let room = RoomId::from_seed(1);
        for t in 0..5 {
            log.append(EventType::ZoneEnter, room, json!({}), t);
        }
        // c_2 was evicted, but everything after it is still retained.
        let page = log.get_since(Some(EventCursor::from_seq(2)), 10);
        assert!(!page.cursor_expired);
        assert_eq!(page.events.len(), 3);
    }

    #[test]
    fn test_cleanup_removes_entries_past_retention() {
        let mut log = small_log(100);
        let room = RoomId::from_seed(1);
        let old = log.append(EventType::ChatMessage, room, json!({}), 1_000);
        log.append(EventType::ChatMessage, room, json!({}), 2_000);
        log.append(EventType::ChatMessage, room, json!({}), 15_000);

        let removed = log.cleanup(14_500);
        assert_eq!(removed, 2);
        assert_eq!(log.len(), 1);

        let page = log.get_since(Some(old), 10);
        assert!(page.cursor_expired);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.next_cursor, log.head_cursor());
    }

    #[test]
    fn test_expired_cursor_on_fully_drained_log_resumes_at_head() {
        let mut log = small_log(100);
        let room = RoomId::from_seed(1);
        let first = log.append(EventType::ChatMessage, room, json!({}), 0);
        log.append(EventType::ChatMessage, room, json!({}), 0);
        log.cleanup(1_000_000);
        assert!(log.is_empty());

        let page = log.get_since(Some(first), 10);
        assert!(page.cursor_expired);
        assert!(page.events.is_empty());
        assert_eq!(page.next_cursor, log.head_cursor());
    }

    #[test]
    fn test_future_cursor_is_expired() {
        let mut log = small_log(100);
        let room = RoomId::from_seed(1);
        log.append(EventType::ChatMessage, room, json!({}), 0);

        let page = log.get_since(Some(EventCursor::from_seq(99)), 10);
        assert!(page.cursor_expired);
        assert_eq!(page.next_cursor, log.head_cursor());
    }

    #[test]
    fn test_malformed_cursor_string_is_expired() {
        let mut log = small_log(100);
        log.append(EventType::ChatMessage, RoomId::from_seed(1), json!({}), 0);
        let page = log.get_since_str(Some("bogus"), 10);
        assert!(page.cursor_expired);
        assert_eq!(page.events.len(), 1);
    }

    #[test]
    fn test_envelope_serializes_type_tag_and_cursor_string() {
        let mut log = small_log(10);
        log.append(EventType::ZoneExit, RoomId::from_seed(1), json!({"zone": "plaza"}), 5);
        let value = serde_json::to_value(log.iter().next().unwrap()).unwrap();
        assert_eq!(value["type"], "zone.exit");
        assert_eq!(value["cursor"], "c_1");
        assert_eq!(
            EventType::from("meeting.started".to_string()),
            EventType::Custom("meeting.started".to_string())
        );
    }

    proptest! {
        #[test]
        fn prop_cursors_strictly_increase_and_pages_never_overlap(
            cap in 1usize..20,
            count in 0usize..60,
            limit in 1usize..8,
        ) {
            let mut log = small_log(cap);
            let room = RoomId::from_seed(3);
            for t in 0..count {
                log.append(EventType::ChatMessage, room, json!({}), t as u64);
            }

            let mut cursor = None;
            let mut last_seen = 0u64;
            loop {
                let page = log.get_since(cursor, limit);
                for e in &page.events {
                    prop_assert!(e.cursor.seq() > last_seen);
                    last_seen = e.cursor.seq();
                }
                cursor = Some(page.next_cursor);
                if !page.has_more {
                    break;
                }
            }
            prop_assert_eq!(last_seen, log.head_cursor().seq());
        }
    }
}
