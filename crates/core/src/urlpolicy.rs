use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

/// Outbound request policy: every upstream URL passes through here before
/// any socket is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlPolicyConfig {
    /// Master switch; disabled means no outbound requests at all
    pub enabled: bool,
    /// Allowed hosts: literal hostnames or CIDR blocks
    pub allow_hosts: Vec<String>,
    /// Allowed URL schemes
    pub allow_schemes: Vec<String>,
    /// Allowed ports; empty list allows any port
    pub allow_ports: Vec<u16>,
}

impl Default for UrlPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_hosts: Vec::new(),
            allow_schemes: vec!["http".to_string(), "https".to_string()],
            allow_ports: Vec::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlPolicyError {
    #[error("outbound requests disabled by policy")]
    Disabled,
    #[error("url has no host")]
    MissingHost,
    #[error("scheme not allowed: {0}")]
    SchemeDenied(String),
    #[error("host not allowed: {0}")]
    HostDenied(String),
    #[error("port not allowed: {0}")]
    PortDenied(u16),
    #[error("userinfo in url is forbidden")]
    UserInfoForbidden,
    #[error("blocked address range: {0}")]
    BlockedRange(IpAddr),
}

#[derive(Debug, Clone)]
enum HostRule {
    Literal(String),
    Cidr4(Ipv4Addr, u8),
    Cidr6(Ipv6Addr, u8),
}

pub struct UrlPolicy {
    enabled: bool,
    hosts: Vec<HostRule>,
    schemes: Vec<String>,
    ports: Vec<u16>,
}

impl UrlPolicy {
    pub fn new(cfg: &UrlPolicyConfig) -> Self {
        let hosts = cfg
            .allow_hosts
            .iter()
            .filter_map(|h| parse_host_rule(h))
            .collect();
        Self {
            enabled: cfg.enabled,
            hosts,
            schemes: cfg
                .allow_schemes
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            ports: cfg.allow_ports.clone(),
        }
    }

    /// Policy that admits everything except the hard-blocked address ranges
    pub fn permissive() -> Self {
        Self {
            enabled: true,
            hosts: Vec::new(),
            schemes: vec!["http".to_string(), "https".to_string()],
            ports: Vec::new(),
        }
    }

    pub fn validate(&self, url: &Url) -> Result<(), UrlPolicyError> {
        if !self.enabled {
            return Err(UrlPolicyError::Disabled);
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(UrlPolicyError::UserInfoForbidden);
        }
        if !self.schemes.iter().any(|s| s == url.scheme()) {
            return Err(UrlPolicyError::SchemeDenied(url.scheme().to_string()));
        }

        let host = match url.host() {
            Some(h) => h,
            None => return Err(UrlPolicyError::MissingHost),
        };

        // Default-port forms equal their no-port forms
        if let Some(port) = url.port_or_known_default() {
            if !self.ports.is_empty() && !self.ports.contains(&port) {
                return Err(UrlPolicyError::PortDenied(port));
            }
        }

        match host {
            Host::Ipv4(ip) => {
                if is_blocked_ip(IpAddr::V4(ip)) {
                    return Err(UrlPolicyError::BlockedRange(IpAddr::V4(ip)));
                }
                if !self.hosts.is_empty() && !self.ip_allowed(IpAddr::V4(ip)) {
                    return Err(UrlPolicyError::HostDenied(ip.to_string()));
                }
            }
            Host::Ipv6(ip) => {
                if is_blocked_ip(IpAddr::V6(ip)) {
                    return Err(UrlPolicyError::BlockedRange(IpAddr::V6(ip)));
                }
                if !self.hosts.is_empty() && !self.ip_allowed(IpAddr::V6(ip)) {
                    return Err(UrlPolicyError::HostDenied(ip.to_string()));
                }
            }
            Host::Domain(name) => {
                let name = normalize_host(name);
                if name == "localhost" {
                    return Err(UrlPolicyError::BlockedRange(IpAddr::V4(
                        Ipv4Addr::LOCALHOST,
                    )));
                }
                if !self.hosts.is_empty() && !self.domain_allowed(name) {
                    return Err(UrlPolicyError::HostDenied(name.to_string()));
                }
            }
        }

        Ok(())
    }

    fn domain_allowed(&self, name: &str) -> bool {
        self.hosts.iter().any(|r| match r {
            HostRule::Literal(l) => l == name,
            _ => false,
        })
    }

    fn ip_allowed(&self, ip: IpAddr) -> bool {
        self.hosts.iter().any(|r| match (r, ip) {
            (HostRule::Literal(l), _) => l == &ip.to_string(),
            (HostRule::Cidr4(net, bits), IpAddr::V4(ip)) => cidr4_contains(*net, *bits, ip),
            (HostRule::Cidr6(net, bits), IpAddr::V6(ip)) => cidr6_contains(*net, *bits, ip),
            _ => false,
        })
    }
}

fn parse_host_rule(s: &str) -> Option<HostRule> {
    let s = normalize_host(s.trim());
    if s.is_empty() {
        return None;
    }
    if let Some((addr, bits)) = s.split_once('/') {
        if let Ok(ip) = addr.parse::<Ipv4Addr>() {
            let bits: u8 = bits.parse().ok()?;
            return (bits <= 32).then_some(HostRule::Cidr4(ip, bits));
        }
        if let Ok(ip) = addr.parse::<Ipv6Addr>() {
            let bits: u8 = bits.parse().ok()?;
            return (bits <= 128).then_some(HostRule::Cidr6(ip, bits));
        }
        return None;
    }
    Some(HostRule::Literal(s.to_ascii_lowercase()))
}

fn normalize_host(h: &str) -> &str {
    h.strip_suffix('.').unwrap_or(h)
}

fn cidr4_contains(net: Ipv4Addr, bits: u8, ip: Ipv4Addr) -> bool {
    if bits == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - bits as u32);
    (u32::from(net) & mask) == (u32::from(ip) & mask)
}

fn cidr6_contains(net: Ipv6Addr, bits: u8, ip: Ipv6Addr) -> bool {
    if bits == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - bits as u32);
    (u128::from(net) & mask) == (u128::from(ip) & mask)
}

/// Loopback, link-local and metadata ranges are never reachable, whatever
/// the allowlist says. IPv4-mapped IPv6 is checked as its embedded IPv4.
fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_link_local() || v4.is_unspecified() || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_ip(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                // link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(hosts: &[&str], ports: &[u16]) -> UrlPolicy {
        UrlPolicy::new(&UrlPolicyConfig {
            enabled: true,
            allow_hosts: hosts.iter().map(|s| s.to_string()).collect(),
            allow_schemes: vec!["http".into(), "https".into()],
            allow_ports: ports.to_vec(),
        })
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn disabled_policy_rejects_everything() {
        let p = UrlPolicy::new(&UrlPolicyConfig {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(
            p.validate(&url("http://receiver.lan/")),
            Err(UrlPolicyError::Disabled)
        );
    }

    #[test]
    fn userinfo_is_always_rejected() {
        let p = UrlPolicy::permissive();
        assert_eq!(
            p.validate(&url("http://user:pw@receiver.lan:8001/svc")),
            Err(UrlPolicyError::UserInfoForbidden)
        );
    }

    #[test]
    fn loopback_and_metadata_ranges_are_blocked() {
        let p = UrlPolicy::permissive();
        for bad in [
            "http://127.0.0.1/",
            "http://127.8.8.8/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "http://[fe80::1]/",
            "http://[::ffff:127.0.0.1]/",
            "http://localhost/",
        ] {
            assert!(p.validate(&url(bad)).is_err(), "{bad} must be blocked");
        }
    }

    #[test]
    fn host_allowlist_literal_and_cidr() {
        let p = policy(&["receiver.lan", "10.0.0.0/24"], &[]);
        assert!(p.validate(&url("http://receiver.lan:8001/")).is_ok());
        assert!(p.validate(&url("http://10.0.0.42:8001/")).is_ok());
        assert_eq!(
            p.validate(&url("http://10.0.1.42:8001/")),
            Err(UrlPolicyError::HostDenied("10.0.1.42".into()))
        );
        assert_eq!(
            p.validate(&url("http://other.lan/")),
            Err(UrlPolicyError::HostDenied("other.lan".into()))
        );
    }

    #[test]
    fn trailing_dot_and_default_port_normalize() {
        let p = policy(&["receiver.lan"], &[80, 8001]);
        assert!(p.validate(&url("http://receiver.lan./")).is_ok());
        // http default port 80 equals the explicit form
        assert!(p.validate(&url("http://receiver.lan/")).is_ok());
        assert_eq!(
            p.validate(&url("http://receiver.lan:9999/")),
            Err(UrlPolicyError::PortDenied(9999))
        );
    }

    #[test]
    fn scheme_allowlist() {
        let p = policy(&[], &[]);
        assert_eq!(
            p.validate(&url("ftp://receiver.lan/")),
            Err(UrlPolicyError::SchemeDenied("ftp".into()))
        );
    }
}
