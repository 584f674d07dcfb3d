//! IRC message parsing and serialization.
//!
//! A wire line looks like `[@tags] [:prefix] COMMAND [params...] [:trailing]`.
//! Parsing is tolerant: anything that doesn't look like an IRC line at all
//! yields [`NotAMessage`] and the caller is expected to pass the raw line
//! through untouched.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

pub const RPL_WELCOME: &str = "001";
pub const RPL_ISUPPORT: &str = "005";
pub const RPL_LOGGEDIN: &str = "900";
pub const RPL_LOGGEDOUT: &str = "901";
pub const ERR_NOSUCHCHANNEL: &str = "403";

/// Line could not be parsed as an IRC message.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("not an irc message")]
pub struct NotAMessage;

/// The `nick!user@host` part of a message source.
///
/// Degrades gracefully: a bare token is a nick, `user@host` without a `!`
/// fills user and host only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefix {
    pub nick: String,
    pub user: String,
    pub host: String,
}

impl Prefix {
    pub fn parse(mask: &str) -> Prefix {
        let mut prefix = Prefix::default();
        let bang = mask.find('!');
        let at = mask.find('@');

        match (bang, at) {
            (None, None) => prefix.nick = mask.to_string(),
            (Some(b), Some(a)) if b < a => {
                prefix.nick = mask[..b].to_string();
                prefix.user = mask[b + 1..a].to_string();
                prefix.host = mask[a + 1..].to_string();
            }
            (Some(b), _) => {
                prefix.nick = mask[..b].to_string();
                prefix.user = mask[b + 1..].to_string();
            }
            (None, Some(a)) => {
                prefix.user = mask[..a].to_string();
                prefix.host = mask[a + 1..].to_string();
            }
        }

        prefix
    }

    pub fn from_server(server_name: &str) -> Prefix {
        Prefix {
            nick: server_name.to_string(),
            user: String::new(),
            host: String::new(),
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nick)?;
        if !self.user.is_empty() {
            write!(f, "!{}", self.user)?;
        }
        if !self.host.is_empty() {
            write!(f, "@{}", self.host)?;
        }
        Ok(())
    }
}

/// A parsed IRC message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub tags: HashMap<String, String>,
    pub prefix: Option<Prefix>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: &str, params: Vec<&str>) -> Message {
        Message {
            tags: HashMap::new(),
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn with_prefix(prefix: Prefix, command: &str, params: Vec<&str>) -> Message {
        Message {
            prefix: Some(prefix),
            ..Message::new(command, params)
        }
    }

    /// Parse a single line, without its trailing CRLF.
    pub fn parse(line: &str) -> Result<Message, NotAMessage> {
        let mut message = Message::default();

        let (mut token, mut rest) = next_token(line);
        if token.is_empty() {
            return Err(NotAMessage);
        }

        if let Some(raw_tags) = token.strip_prefix('@') {
            for tag in raw_tags.split(';') {
                if tag.is_empty() {
                    continue;
                }
                match tag.split_once('=') {
                    Some((key, value)) => {
                        message.tags.insert(key.to_string(), unescape_tag_value(value))
                    }
                    None => message.tags.insert(tag.to_string(), String::new()),
                };
            }
            (token, rest) = next_token(rest);
        }

        if let Some(mask) = token.strip_prefix(':') {
            message.prefix = Some(Prefix::parse(mask));
            (token, rest) = next_token(rest);
        }

        if token.is_empty() {
            return Err(NotAMessage);
        }
        message.command = token.to_string();

        loop {
            let trimmed = rest.trim_start_matches(' ');
            if trimmed.is_empty() {
                break;
            }
            if let Some(trailing) = trimmed.strip_prefix(':') {
                message.params.push(trailing.to_string());
                break;
            }
            let (token, next) = match trimmed.split_once(' ') {
                Some((token, next)) => (token, next),
                None => (trimmed, ""),
            };
            message.params.push(token.to_string());
            rest = next;
        }

        Ok(message)
    }

    /// Positional parameter accessor with a default.
    pub fn get_param<'a>(&'a self, idx: usize, default: &'a str) -> &'a str {
        self.params.get(idx).map(String::as_str).unwrap_or(default)
    }

    /// Uppercased positional parameter, for case-insensitive comparisons.
    pub fn get_param_upper(&self, idx: usize) -> String {
        self.get_param(idx, "").to_ascii_uppercase()
    }

    pub fn command_upper(&self) -> String {
        self.command.to_ascii_uppercase()
    }

    /// Serialize to canonical wire form, without trailing CRLF.
    pub fn to_line(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut keys: Vec<&String> = self.tags.keys().collect();
            keys.sort();
            write!(f, "@")?;
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                let value = &self.tags[*key];
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag_value(value))?;
                }
            }
            write!(f, " ")?;
        }

        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }

        write!(f, "{}", self.command)?;

        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1
                && (param.is_empty() || param.contains(' ') || param.starts_with(':'))
            {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }

        Ok(())
    }
}

/// Pull the next space-separated token off the front of `s`.
fn next_token(s: &str) -> (&str, &str) {
    let s = s.trim_start_matches(' ');
    if s.is_empty() {
        return ("", "");
    }

    match s.split_once(' ') {
        Some((token, rest)) => (token, rest),
        None => (s, ""),
    }
}

/// IRCv3 message-tag value escaping.
fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        // An invalid or dangling escape drops the backslash.
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(c) => out.push(c),
            None => {}
        }
    }
    out
}
