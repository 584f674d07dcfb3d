//! DNS blocklist lookups for new client addresses.

use std::net::IpAddr;
use std::time::Duration;

use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

pub fn resolver() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
}

/// True if `ip` appears on any of the configured blocklists. Lookup errors
/// (including NXDOMAIN, the common not-listed answer) count as not listed.
pub async fn is_listed(resolver: &TokioAsyncResolver, servers: &[String], ip: IpAddr) -> bool {
    let reversed = reverse_for_lookup(ip);
    for server in servers {
        let name = format!("{reversed}.{server}.");
        let lookup = tokio::time::timeout(Duration::from_secs(5), resolver.lookup_ip(name.clone())).await;
        match lookup {
            Ok(Ok(answer)) if answer.iter().next().is_some() => {
                tracing::info!(%ip, %server, "address is DNSBL listed");
                return true;
            }
            Ok(_) | Err(_) => {}
        }
    }
    false
}

/// Reverse-DNS lookup of a client address, for the WEBIRC hostname field.
/// Falls back to the address itself when there is no PTR record.
pub async fn reverse_hostname(resolver: &TokioAsyncResolver, ip: IpAddr) -> String {
    let lookup = tokio::time::timeout(Duration::from_secs(3), resolver.reverse_lookup(ip)).await;
    if let Ok(Ok(names)) = lookup {
        if let Some(name) = names.iter().next() {
            return name.to_string().trim_end_matches('.').to_string();
        }
    }
    ip.to_string()
}

/// `127.0.0.2` → `2.0.0.127`; IPv6 expands to reversed dotted nibbles.
fn reverse_for_lookup(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let nibbles: Vec<String> = v6
                .octets()
                .iter()
                .flat_map(|byte| [byte >> 4, byte & 0x0f])
                .map(|n| format!("{n:x}"))
                .rev()
                .collect();
            nibbles.join(".")
        }
    }
}
