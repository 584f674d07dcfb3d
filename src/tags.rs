//! Short-lived store for client-originated message tags.
//!
//! When a client sends a PRIVMSG/NOTICE/TAGMSG carrying `+`-prefixed tags,
//! the tags are stripped before the line goes upstream (the server would
//! reject or mangle them) and remembered here. When the server's copy of the
//! message comes back to any session on the same gateway, the tags are
//! re-attached so tag-capable clients see them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::irc::Message;

const ENTRY_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct StoredTags {
    tags: HashMap<String, String>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MessageTagStore {
    entries: Mutex<HashMap<String, StoredTags>>,
}

/// Only commands whose server echo is byte-recognizable can carry client tags.
pub fn can_message_contain_client_tags(message: &Message) -> bool {
    matches!(message.command_upper().as_str(), "PRIVMSG" | "NOTICE" | "TAGMSG")
}

impl MessageTagStore {
    pub fn new() -> MessageTagStore {
        MessageTagStore::default()
    }

    /// Record the `+`-prefixed tags of an outbound client message.
    pub fn add_tags_from_message(&self, session_id: u64, nick: &str, message: &Message) {
        let client_tags: HashMap<String, String> = message
            .tags
            .iter()
            .filter(|(key, _)| key.starts_with('+'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if client_tags.is_empty() {
            return;
        }

        let key = fingerprint(nick, message);
        tracing::trace!(session = session_id, %nick, "storing {} client tag(s)", client_tags.len());

        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, stored| stored.expires_at > now);
        entries.insert(
            key,
            StoredTags {
                tags: client_tags,
                expires_at: now + ENTRY_TTL,
            },
        );
    }

    /// Look up stored tags for a server echo. A hit refreshes the entry so
    /// the same echo fanned out to several local clients can reuse it until
    /// the TTL retires it.
    pub fn get_tags_from_message(
        &self,
        session_id: u64,
        nick: &str,
        message: &Message,
    ) -> Option<HashMap<String, String>> {
        let key = fingerprint(nick, message);
        let mut entries = self.entries.lock();
        let stored = entries.get_mut(&key)?;
        if stored.expires_at <= Instant::now() {
            entries.remove(&key);
            return None;
        }
        stored.expires_at = Instant::now() + ENTRY_TTL;
        tracing::trace!(session = session_id, %nick, "re-attaching stored client tags");
        Some(stored.tags.clone())
    }
}

/// Normalized fingerprint over (nick, command, target, text). The server may
/// rewrite the prefix on the echo but never these four.
fn fingerprint(nick: &str, message: &Message) -> String {
    let target = message.get_param(0, "");
    let text = if message.params.len() > 1 {
        message.params.last().map(String::as_str).unwrap_or("")
    } else {
        ""
    };

    let mut hasher = Sha256::new();
    hasher.update(nick.to_lowercase());
    hasher.update([0]);
    hasher.update(message.command_upper());
    hasher.update([0]);
    hasher.update(target.to_lowercase());
    hasher.update([0]);
    hasher.update(text);
    format!("{:x}", hasher.finalize())
}
