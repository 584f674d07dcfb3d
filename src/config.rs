//! Gateway configuration.
//!
//! Everything is a flat flag so the whole configuration is expressible on the
//! command line (or an env-file wrapper); tests construct `Config` directly
//! through `Default`.

use std::net::IpAddr;

use clap::{Parser, ValueEnum};
use ipnet::IpNet;
use rand::Rng;

/// Descriptor for one candidate upstream IRC server.
#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    pub hostname: String,
    pub port: u16,
    pub tls: bool,
    /// "tcp" (default) or "unix"; for "unix", `hostname` is the socket path.
    pub network: String,
    pub timeout_secs: u64,
    /// Post-registration client line throttle, lines per second. 0 = off.
    pub throttle: u32,
    pub webirc_password: String,
    pub server_password: String,
    pub gateway_name: String,
    /// Overrides the EXTJWT `iss` claim when several hostnames form one network.
    pub network_common_address: String,
    pub local_addr: Option<IpAddr>,
    pub proxy: Option<ProxyConfig>,
}

/// A proxy hop that opens the final TCP+TLS leg on our behalf.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub hostname: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    pub interface: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum DnsblAction {
    /// Listed clients must pass CAPTCHA verification before connecting.
    #[default]
    Verify,
    /// Listed clients are refused outright.
    Deny,
}

impl std::fmt::Display for DnsblAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DnsblAction::Verify => "verify",
            DnsblAction::Deny => "deny",
        })
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "webirc-gateway", version, about)]
pub struct Config {
    /// HTTP/WebSocket listen address.
    #[arg(long, default_value = "127.0.0.1:7778")]
    pub listen_addr: String,

    /// Optional raw TCP listen address (newline-framed IRC lines).
    #[arg(long)]
    pub tcp_listen_addr: Option<String>,

    /// Candidate upstreams, `host:port` or `host:+port` for TLS. One is
    /// chosen uniformly at random per connection.
    #[arg(long = "upstream", value_parser = parse_upstream)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Allow clients to pick their own destination with HOST.
    #[arg(long)]
    pub gateway: bool,

    /// Wildcard patterns of allowed HOST destinations. Empty = all allowed.
    #[arg(long = "gateway-whitelist")]
    pub gateway_whitelist: Vec<String>,

    /// Upstream dial timeout in seconds.
    #[arg(long, default_value_t = 10)]
    pub gateway_timeout: u64,

    /// Post-registration throttle for client lines, per second. 0 = off.
    #[arg(long, default_value_t = 0)]
    pub gateway_throttle: u32,

    /// WEBIRC passwords for client-picked destinations, `host=password`.
    #[arg(long = "webirc-password", value_parser = parse_key_value)]
    pub gateway_webirc_password: Vec<(String, String)>,

    /// Wildcard patterns of allowed Origin headers. Empty = all allowed.
    #[arg(long = "remote-origin")]
    pub remote_origins: Vec<String>,

    /// CIDR ranges trusted to set X-Forwarded-For / X-Forwarded-Proto.
    #[arg(long = "reverse-proxy")]
    pub reverse_proxies: Vec<IpNet>,

    /// Template for the USER username parameter (%a %i %h %n).
    #[arg(long, default_value = "")]
    pub client_username: String,

    /// Template for the USER realname parameter (%a %i %h %n).
    #[arg(long, default_value = "")]
    pub client_realname: String,

    /// Template for the WEBIRC hostname parameter (%a %i %h %n).
    #[arg(long, default_value = "")]
    pub client_hostname: String,

    /// Gateway name announced in the WEBIRC command.
    #[arg(long, default_value = "webircgateway")]
    pub gateway_name: String,

    /// Require CAPTCHA verification before any upstream connection.
    #[arg(long)]
    pub requires_verification: bool,

    #[arg(long, default_value = "")]
    pub recaptcha_secret: String,

    #[arg(long, default_value = "https://www.google.com/recaptcha/api/siteverify")]
    pub recaptcha_url: String,

    /// DNSBL servers to check new clients against.
    #[arg(long = "dnsbl")]
    pub dnsbl_servers: Vec<String>,

    #[arg(long, value_enum, default_value_t = DnsblAction::Verify)]
    pub dnsbl_action: DnsblAction,

    /// If non-empty, a QUIT with this message is sent upstream when a
    /// connected client closes without quitting.
    #[arg(long, default_value = "")]
    pub send_quit_on_client_close: String,

    /// Answer ident queries for upstream connections.
    #[arg(long)]
    pub identd: bool,

    /// Listen address for the ident responder.
    #[arg(long, default_value = "0.0.0.0:113")]
    pub identd_listen_addr: String,

    /// HMAC key for EXTJWT token signing.
    #[arg(long, default_value = "")]
    pub secret: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "127.0.0.1:7778".to_string(),
            tcp_listen_addr: None,
            upstreams: Vec::new(),
            gateway: false,
            gateway_whitelist: Vec::new(),
            gateway_timeout: 10,
            gateway_throttle: 0,
            gateway_webirc_password: Vec::new(),
            remote_origins: Vec::new(),
            reverse_proxies: Vec::new(),
            client_username: String::new(),
            client_realname: String::new(),
            client_hostname: String::new(),
            gateway_name: "webircgateway".to_string(),
            requires_verification: false,
            recaptcha_secret: String::new(),
            recaptcha_url: "https://www.google.com/recaptcha/api/siteverify".to_string(),
            dnsbl_servers: Vec::new(),
            dnsbl_action: DnsblAction::Verify,
            send_quit_on_client_close: String::new(),
            identd: false,
            identd_listen_addr: "0.0.0.0:113".to_string(),
            secret: String::new(),
        }
    }
}

impl Config {
    /// Empty origin list = all origins allowed; no Origin header = same page.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.remote_origins.is_empty() || origin.is_empty() {
            return true;
        }
        self.remote_origins.iter().any(|p| wildcard_match(p, origin))
    }

    /// Empty whitelist = all destinations allowed.
    pub fn is_irc_address_allowed(&self, addr: &str) -> bool {
        if self.gateway_whitelist.is_empty() {
            return true;
        }
        self.gateway_whitelist.iter().any(|p| wildcard_match(p, addr))
    }

    pub fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.reverse_proxies.iter().any(|net| net.contains(&ip))
    }

    pub fn find_webirc_password(&self, irc_host: &str) -> String {
        let host = irc_host.to_lowercase();
        self.gateway_webirc_password
            .iter()
            .find(|(h, _)| *h == host)
            .map(|(_, pw)| pw.clone())
            .unwrap_or_default()
    }

    /// Pick a pre-set upstream uniformly at random.
    pub fn choose_upstream(&self) -> Option<UpstreamConfig> {
        if self.upstreams.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.upstreams.len());
        Some(self.upstreams[idx].clone())
    }

    /// Build an upstream descriptor for a client-picked HOST destination.
    pub fn upstream_for_dest(&self, host: &str, port: u16, tls: bool) -> UpstreamConfig {
        UpstreamConfig {
            hostname: host.to_string(),
            port,
            tls,
            network: "tcp".to_string(),
            timeout_secs: self.gateway_timeout,
            throttle: self.gateway_throttle,
            webirc_password: self.find_webirc_password(host),
            ..UpstreamConfig::default()
        }
    }
}

/// `host:port`, `host:+port` (TLS) or `unix:/path/to/socket`.
fn parse_upstream(s: &str) -> Result<UpstreamConfig, String> {
    if let Some(path) = s.strip_prefix("unix:") {
        return Ok(UpstreamConfig {
            hostname: path.to_string(),
            network: "unix".to_string(),
            timeout_secs: 10,
            ..UpstreamConfig::default()
        });
    }

    let (host, port_part) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got {s:?}"))?;
    let (tls, port_str) = match port_part.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, port_part),
    };
    let port: u16 = port_str.parse().map_err(|_| format!("bad port {port_str:?}"))?;

    Ok(UpstreamConfig {
        hostname: host.to_string(),
        port,
        tls,
        network: "tcp".to_string(),
        timeout_secs: 10,
        ..UpstreamConfig::default()
    })
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    Ok((key.to_lowercase(), value.to_string()))
}

/// Simple wildcard matching (* and ?), case-insensitive.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let text = text.to_lowercase();
    wildcard_match_inner(pattern.as_bytes(), text.as_bytes())
}

fn wildcard_match_inner(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            wildcard_match_inner(&pattern[1..], text)
                || (!text.is_empty() && wildcard_match_inner(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => wildcard_match_inner(&pattern[1..], &text[1..]),
        (Some(a), Some(b)) if a == b => wildcard_match_inner(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// Expand the configurable `%a %i %h %n` placeholders.
pub fn make_client_replacements(
    template: &str,
    remote_addr: &str,
    remote_hostname: &str,
    nick: &str,
) -> String {
    template
        .replace("%a", remote_addr)
        .replace("%i", &ipv4_to_hex(remote_addr))
        .replace("%h", remote_hostname)
        .replace("%n", nick)
}

/// `10.1.2.3` → `0a010203`. Non-IPv4 input hexes as zeroes, matching the
/// behavior IRCds expect from legacy ident-style usernames.
pub fn ipv4_to_hex(ip: &str) -> String {
    let mut octets = [0u8; 4];
    for (i, part) in ip.split('.').take(4).enumerate() {
        octets[i] = part.parse().unwrap_or(0);
    }
    format!("{:02x}{:02x}{:02x}{:02x}", octets[0], octets[1], octets[2], octets[3])
}
