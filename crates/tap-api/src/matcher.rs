//! Request/response pairing

use std::time::{Duration, Instant, SystemTime};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::message::Message;

/// A request and its response, with the time between them.
#[derive(Debug, Clone)]
pub struct MatchedPair {
    pub request:    Message,
    pub response:   Message,
    /// Never below 1 ms
    pub elapsed_ms: i64,
}

/// Result of registering one half of an exchange.
#[derive(Debug)]
pub enum MatchOutcome {
    /// The other half was waiting under the same key
    Matched(Box<MatchedPair>),
    /// Stored until the other half arrives
    Stored,
    /// A message of the same kind already waits under this key; the new one
    /// was discarded and the old one kept
    Duplicate,
}

impl MatchOutcome {
    pub fn into_pair(self) -> Option<MatchedPair> {
        match self {
            Self::Matched(pair) => Some(*pair),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Pending {
    message:     Message,
    inserted_at: Instant,
}

/// Pairs requests with responses by a protocol-specific key.
///
/// One matcher exists per dissector per stream; the stream's two reader
/// threads register into it concurrently.
#[derive(Debug, Default)]
pub struct RequestResponseMatcher {
    pending: DashMap<String, Pending>,
}

impl RequestResponseMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request(&self, key: impl Into<String>, request: Message) -> MatchOutcome {
        debug_assert!(request.is_request);
        self.register(key.into(), request)
    }

    pub fn register_response(&self, key: impl Into<String>, response: Message) -> MatchOutcome {
        debug_assert!(!response.is_request);
        self.register(key.into(), response)
    }

    fn register(&self, key: String, message: Message) -> MatchOutcome {
        match self.pending.entry(key) {
            Entry::Occupied(entry) => {
                if entry.get().message.is_request == message.is_request {
                    return MatchOutcome::Duplicate;
                }
                let other = entry.remove().message;
                let (request, response) = if message.is_request {
                    (message, other)
                } else {
                    (other, message)
                };
                let elapsed_ms = elapsed_ms(request.capture_time, response.capture_time);
                MatchOutcome::Matched(Box::new(MatchedPair {
                    request,
                    response,
                    elapsed_ms,
                }))
            },
            Entry::Vacant(entry) => {
                entry.insert(Pending {
                    message,
                    inserted_at: Instant::now(),
                });
                MatchOutcome::Stored
            },
        }
    }

    /// Whether a request is waiting under `key`
    pub fn has_pending_request(&self, key: &str) -> bool {
        self.pending
            .get(key)
            .is_some_and(|p| p.message.is_request)
    }

    /// Remove entries stored before `cutoff`, returning how many were removed.
    pub fn delete_older_than(&self, cutoff: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.inserted_at >= cutoff);
        before.saturating_sub(self.pending.len())
    }

    /// Number of messages waiting for their other half
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn elapsed_ms(request: SystemTime, response: SystemTime) -> i64 {
    let ms = response
        .duration_since(request)
        .unwrap_or(Duration::ZERO)
        .as_millis();
    i64::try_from(ms).unwrap_or(i64::MAX).max(1)
}
