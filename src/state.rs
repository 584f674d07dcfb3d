//! Per-session view of the upstream IRC connection state.
//!
//! The selector task is the main writer, but the EXTJWT handler and the
//! TAGMSG fan-out read channel membership from other tasks, so the channel
//! map and the ISUPPORT token set sit behind their own locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

/// A channel the client's own nick has joined.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub modes: HashMap<String, String>,
    pub joined_at: SystemTime,
}

impl Channel {
    pub fn new(name: &str) -> Channel {
        Channel {
            name: name.to_string(),
            modes: HashMap::new(),
            joined_at: SystemTime::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Identity {
    nick: String,
    username: String,
    realname: String,
    account: String,
    password: String,
}

/// ISUPPORT (005) accumulation. `received` latches on the first 005,
/// `injected` latches when the gateway has emitted its synthetic 005.
#[derive(Debug, Default)]
pub struct ISupport {
    inner: Mutex<ISupportInner>,
}

#[derive(Debug, Default)]
struct ISupportInner {
    received: bool,
    injected: bool,
    tokens: HashMap<String, String>,
    tags: HashMap<String, String>,
}

impl ISupport {
    pub fn received(&self) -> bool {
        self.inner.lock().received
    }

    pub fn mark_received(&self) {
        self.inner.lock().received = true;
    }

    pub fn injected(&self) -> bool {
        self.inner.lock().injected
    }

    pub fn mark_injected(&self) {
        self.inner.lock().injected = true;
    }

    pub fn add_token(&self, token_pair: &str) {
        let mut inner = self.inner.lock();
        add_token(&mut inner.tokens, token_pair);
    }

    pub fn add_tokens<S: AsRef<str>>(&self, token_pairs: &[S]) {
        let mut inner = self.inner.lock();
        for pair in token_pairs {
            add_token(&mut inner.tokens, pair.as_ref());
        }
    }

    pub fn has_token(&self, key: &str) -> bool {
        self.inner.lock().tokens.contains_key(&key.to_ascii_uppercase())
    }

    pub fn get_token(&self, key: &str) -> Option<String> {
        self.inner.lock().tokens.get(&key.to_ascii_uppercase()).cloned()
    }

    /// Remember the message tags seen on a 005 line (the synthetic 005
    /// copies the server's `time` tag when present).
    pub fn set_tags(&self, tags: HashMap<String, String>) {
        self.inner.lock().tags = tags;
    }

    pub fn get_tag(&self, key: &str) -> Option<String> {
        self.inner.lock().tags.get(key).cloned()
    }
}

fn add_token(tokens: &mut HashMap<String, String>, token_pair: &str) {
    let (key, value) = match token_pair.split_once('=') {
        Some((key, value)) => (key, value),
        None => (token_pair, ""),
    };
    tokens.insert(key.to_ascii_uppercase(), value.to_string());
}

/// The gateway's mutable view of one client's IRC identity and membership.
#[derive(Debug, Default)]
pub struct IrcState {
    identity: Mutex<Identity>,
    channels: Mutex<HashMap<String, Channel>>,
    pub isupport: ISupport,
    pub local_port: AtomicU16,
    pub remote_port: AtomicU16,
    pub sent_pass: AtomicBool,
}

impl IrcState {
    pub fn nick(&self) -> String {
        self.identity.lock().nick.clone()
    }

    pub fn set_nick(&self, nick: &str) {
        self.identity.lock().nick = nick.to_string();
    }

    pub fn username(&self) -> String {
        self.identity.lock().username.clone()
    }

    pub fn set_username(&self, username: &str) {
        self.identity.lock().username = username.to_string();
    }

    pub fn realname(&self) -> String {
        self.identity.lock().realname.clone()
    }

    pub fn set_realname(&self, realname: &str) {
        self.identity.lock().realname = realname.to_string();
    }

    pub fn account(&self) -> String {
        self.identity.lock().account.clone()
    }

    pub fn set_account(&self, account: &str) {
        self.identity.lock().account = account.to_string();
    }

    pub fn password(&self) -> String {
        self.identity.lock().password.clone()
    }

    pub fn set_password(&self, password: &str) {
        self.identity.lock().password = password.to_string();
    }

    pub fn set_channel(&self, channel: Channel) {
        self.channels.lock().insert(channel.name.to_lowercase(), channel);
    }

    pub fn remove_channel(&self, name: &str) {
        self.channels.lock().remove(&name.to_lowercase());
    }

    pub fn clear_channels(&self) {
        self.channels.lock().clear();
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.lock().contains_key(&name.to_lowercase())
    }

    pub fn get_channel(&self, name: &str) -> Option<Channel> {
        self.channels.lock().get(&name.to_lowercase()).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Toggle a mode on a tracked channel. Only channels established by our
    /// own JOIN exist here; a MODE for anything else is ignored.
    pub fn set_channel_mode(&self, name: &str, mode: &str, adding: bool) {
        let mut channels = self.channels.lock();
        let Some(entry) = channels.get_mut(&name.to_lowercase()) else {
            return;
        };
        if adding {
            entry.modes.insert(mode.to_string(), String::new());
        } else {
            entry.modes.remove(mode);
        }
    }

    pub fn set_ports(&self, local: u16, remote: u16) {
        self.local_port.store(local, Ordering::Relaxed);
        self.remote_port.store(remote, Ordering::Relaxed);
    }

    pub fn ports(&self) -> (u16, u16) {
        (
            self.local_port.load(Ordering::Relaxed),
            self.remote_port.load(Ordering::Relaxed),
        )
    }
}
