//! Time-windowed registry of panel display messages.
//!
//! Two kinds of entries are kept:
//! - system messages, keyed by the check-system text with padding trimmed
//! - text-pattern hits, keyed by the normalized pattern found in a display line
//!
//! An entry is visible for `expiry` after it was last seen. Expired entries are
//! never returned and are purged on the next observation.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::entities::normalize_text;
use crate::error::{BridgeError, Result};

/// Kind of registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKind {
    System,
    Text,
}

/// Selects which entries a query considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFilter {
    Any,
    System,
    Text,
}

impl MessageFilter {
    fn accepts(&self, kind: MessageKind) -> bool {
        match self {
            MessageFilter::Any => true,
            MessageFilter::System => kind == MessageKind::System,
            MessageFilter::Text => kind == MessageKind::Text,
        }
    }
}

/// A single observed message.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    /// Text as last observed (padding trimmed).
    pub text: String,
    pub last_seen: Instant,
    pub kind: MessageKind,
}

#[derive(Debug)]
pub struct MessageRegistry {
    expiry: Duration,
    patterns: Vec<String>,
    entries: BTreeMap<(MessageKind, String), RegistryEntry>,
}

impl MessageRegistry {
    /// Create a registry.
    ///
    /// `patterns` are normalized here; empty patterns are dropped.
    pub fn new(expiry: Duration, patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Result<Self> {
        if expiry.is_zero() {
            return Err(BridgeError::validation(
                "message expiry must be greater than zero",
            ));
        }

        let mut patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| normalize_text(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        patterns.sort();
        patterns.dedup();

        Ok(Self {
            expiry,
            patterns,
            entries: BTreeMap::new(),
        })
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Normalized patterns being watched.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Observe a message now.
    pub fn observe(&mut self, raw: Option<&str>, kind: MessageKind) {
        self.observe_at(raw, kind, Instant::now());
    }

    /// Observe a message at `now`.
    ///
    /// System messages are recorded verbatim minus surrounding spaces and NULs.
    /// Text lines record one entry per watched pattern they contain. Absent or
    /// blank input records nothing, though expired entries are still purged.
    pub fn observe_at(&mut self, raw: Option<&str>, kind: MessageKind, now: Instant) {
        if let Some(raw) = raw {
            let text = raw.trim_matches(|c: char| c == ' ' || c == '\0');
            if !text.is_empty() {
                match kind {
                    MessageKind::System => self.record(kind, text.to_string(), text, now),
                    MessageKind::Text => {
                        let line = normalize_text(text);
                        let hits: Vec<String> = self
                            .patterns
                            .iter()
                            .filter(|p| line.contains(p.as_str()))
                            .cloned()
                            .collect();
                        for pattern in hits {
                            self.record(kind, pattern, text, now);
                        }
                    }
                }
            }
        }

        self.purge(now);
    }

    fn record(&mut self, kind: MessageKind, key: String, text: &str, now: Instant) {
        tracing::trace!(?kind, key = %key, "Observed message");
        self.entries.insert(
            (kind, key),
            RegistryEntry {
                text: text.to_string(),
                last_seen: now,
                kind,
            },
        );
    }

    /// Drop every entry older than the expiry window.
    pub fn purge(&mut self, now: Instant) {
        let expiry = self.expiry;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= expiry);
    }

    fn live(&self, filter: MessageFilter, now: Instant) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        let expiry = self.expiry;
        self.entries
            .iter()
            .filter(move |((kind, _), entry)| {
                filter.accepts(*kind) && now.saturating_duration_since(entry.last_seen) <= expiry
            })
            .map(|((_, key), entry)| (key, entry))
    }

    /// Sorted unexpired message keys matching `filter`.
    pub fn query_messages(&self, filter: MessageFilter) -> Vec<String> {
        self.query_messages_at(filter, Instant::now())
    }

    pub fn query_messages_at(&self, filter: MessageFilter, now: Instant) -> Vec<String> {
        let mut keys: Vec<String> = self.live(filter, now).map(|(k, _)| k.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Whether an unexpired entry matches `message`.
    ///
    /// Both sides are compared in normalized form for every filter.
    pub fn has_message(&self, message: &str, filter: MessageFilter) -> bool {
        self.has_message_at(message, filter, Instant::now())
    }

    pub fn has_message_at(&self, message: &str, filter: MessageFilter, now: Instant) -> bool {
        let wanted = normalize_text(message);
        if wanted.is_empty() {
            return false;
        }
        self.live(filter, now)
            .any(|(key, _)| normalize_text(key) == wanted)
    }

    /// Entry lookup by kind and exact key.
    pub fn entry(&self, kind: MessageKind, key: &str) -> Option<&RegistryEntry> {
        self.entries.get(&(kind, key.to_string()))
    }

    /// Number of stored entries, including any not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
