use crate::urlpolicy::{UrlPolicy, UrlPolicyError};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Transport stream packet size
pub const TS_PACKET: usize = 188;
/// MPEG-TS sync byte
pub const TS_SYNC: u8 = 0x47;
/// Consecutive sync hits required at one alignment
const SYNC_PACKETS: usize = 3;

/// Closed set of preflight failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreflightReason {
    EmptyUrl,
    InvalidUrl,
    HttpStatus(u16),
    ShortRead,
    RelayUnstable,
    Timeout,
    SyncMiss,
    RequestFailed,
}

impl Display for PreflightReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PreflightReason::EmptyUrl => write!(f, "empty-url"),
            PreflightReason::InvalidUrl => write!(f, "invalid-url"),
            PreflightReason::HttpStatus(code) => write!(f, "http-status-{code}"),
            PreflightReason::ShortRead => write!(f, "short-read"),
            PreflightReason::RelayUnstable => write!(f, "relay-unstable"),
            PreflightReason::Timeout => write!(f, "timeout"),
            PreflightReason::SyncMiss => write!(f, "sync-miss"),
            PreflightReason::RequestFailed => write!(f, "request-failed"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("preflight failed: {reason}")]
pub struct PreflightError {
    pub reason: PreflightReason,
}

impl From<PreflightReason> for PreflightError {
    fn from(reason: PreflightReason) -> Self {
        Self { reason }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    /// Budget for one candidate URL, connect plus body read
    pub timeout: Duration,
    /// Relay port gets the stricter packet count and its own short-read reason
    pub relay_port: u16,
    /// Direct streaming port used as the first fallback
    pub direct_port: u16,
    /// Packets to read on a normal port
    pub packets: usize,
    /// Packets to read on the relay port
    pub relay_packets: usize,
    /// Receiver credentials, injected only on allowlisted ports
    pub credentials: Option<Credentials>,
    /// Ports that may carry basic auth
    pub auth_ports: Vec<u16>,
    /// Try direct-port and playlist URLs after a relay-port failure
    pub fallback_enabled: bool,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            relay_port: 17_999,
            direct_port: 8_001,
            packets: 3,
            relay_packets: 10,
            credentials: None,
            auth_ports: vec![80, 443],
            fallback_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreflightOk {
    /// The candidate that passed; feed this to the encoder
    pub url: Url,
    pub bytes_read: usize,
}

/// Bounded probe of an upstream URL: confirm the body starts with a valid
/// transport-stream sync pattern before a pipeline is spent on it.
pub struct Preflight {
    cfg: PreflightConfig,
    policy: Arc<UrlPolicy>,
    http: reqwest::Client,
}

impl Preflight {
    pub fn new(cfg: PreflightConfig, policy: Arc<UrlPolicy>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(cfg.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { cfg, policy, http })
    }

    /// Validate a raw URL and inject credentials where policy allows
    pub fn prepare_url(&self, raw: &str) -> Result<Url, PreflightError> {
        if raw.trim().is_empty() {
            return Err(PreflightReason::EmptyUrl.into());
        }
        let mut url: Url = raw
            .parse()
            .map_err(|_| PreflightError::from(PreflightReason::InvalidUrl))?;
        if url.host_str().is_none() {
            return Err(PreflightReason::InvalidUrl.into());
        }
        if let Err(e) = self.policy.validate(&url) {
            debug!(url = raw, error = %e, "upstream url refused");
            return Err(match e {
                UrlPolicyError::Disabled => PreflightReason::RequestFailed.into(),
                _ => PreflightReason::InvalidUrl.into(),
            });
        }

        if let Some(creds) = &self.cfg.credentials {
            let port = url.port_or_known_default().unwrap_or_default();
            if self.cfg.auth_ports.contains(&port) {
                let _ = url.set_username(&creds.username);
                let _ = url.set_password(Some(&creds.password));
            }
        }
        Ok(url)
    }

    /// Probe one candidate. Does not validate; callers go through
    /// [Preflight::prepare_url] first.
    pub async fn check(&self, url: &Url) -> Result<PreflightOk, PreflightError> {
        let relay = url.port_or_known_default() == Some(self.cfg.relay_port);
        let packets = if relay {
            self.cfg.relay_packets.max(SYNC_PACKETS)
        } else {
            self.cfg.packets.max(SYNC_PACKETS)
        };
        let want = packets * TS_PACKET;

        let read = tokio::time::timeout(self.cfg.timeout, self.read_prefix(url, want)).await;
        let buf = match read {
            Err(_) => return Err(PreflightReason::Timeout.into()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(buf)) => buf,
        };

        if buf.len() < want {
            let reason = if relay {
                PreflightReason::RelayUnstable
            } else {
                PreflightReason::ShortRead
            };
            return Err(reason.into());
        }
        if !scan_ts_sync(&buf, SYNC_PACKETS) {
            return Err(PreflightReason::SyncMiss.into());
        }
        Ok(PreflightOk {
            url: url.clone(),
            bytes_read: buf.len(),
        })
    }

    /// Probe with the ordered fallback chain.
    ///
    /// A relay-port failure retries once on the direct streaming port (the
    /// service reference becomes the path) and once on the receiver's
    /// playlist URL. The error carries the first failure's reason.
    pub async fn check_with_fallback(
        &self,
        url: &Url,
        service_ref: &str,
        playlist_url: Option<&str>,
    ) -> Result<PreflightOk, PreflightError> {
        let first_err = match self.check(url).await {
            Ok(ok) => return Ok(ok),
            Err(e) => e,
        };

        let relay = url.port_or_known_default() == Some(self.cfg.relay_port);
        if !relay || !self.cfg.fallback_enabled {
            return Err(first_err);
        }

        warn!(
            url = %url, reason = %first_err.reason,
            "relay preflight failed, trying fallback chain"
        );
        for candidate in self.fallback_candidates(url, service_ref, playlist_url) {
            match self.check(&candidate).await {
                Ok(ok) => {
                    debug!(url = %candidate, "fallback candidate passed preflight");
                    return Ok(ok);
                }
                Err(e) => {
                    debug!(url = %candidate, reason = %e.reason, "fallback candidate failed");
                }
            }
        }
        Err(first_err)
    }

    /// Direct-port variant first, then the playlist-style URL
    fn fallback_candidates(
        &self,
        relay_url: &Url,
        service_ref: &str,
        playlist_url: Option<&str>,
    ) -> Vec<Url> {
        let mut out = Vec::new();

        let mut direct = relay_url.clone();
        if direct.set_port(Some(self.cfg.direct_port)).is_ok() {
            direct.set_path(&format!("/{service_ref}"));
            direct.set_query(None);
            out.push(direct);
        }
        if let Some(raw) = playlist_url {
            if let Ok(url) = self.prepare_url(raw) {
                out.push(url);
            }
        }
        out
    }

    async fn read_prefix(&self, url: &Url, want: usize) -> Result<Vec<u8>, PreflightError> {
        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            // Do not touch the body on a bad status
            return Err(PreflightReason::HttpStatus(status.as_u16()).into());
        }

        let mut buf: Vec<u8> = Vec::with_capacity(want);
        let mut stream = resp.bytes_stream();
        while buf.len() < want {
            match stream.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(classify_request_error(e)),
                None => break,
            }
        }
        Ok(buf)
    }
}

fn classify_request_error(e: reqwest::Error) -> PreflightError {
    if e.is_timeout() {
        PreflightReason::Timeout.into()
    } else {
        PreflightReason::RequestFailed.into()
    }
}

/// A sync byte must repeat every 188 bytes for `packets` consecutive
/// packets, at any alignment within the first packet.
pub fn scan_ts_sync(buf: &[u8], packets: usize) -> bool {
    if packets == 0 || buf.len() < packets * TS_PACKET {
        return false;
    }
    (0..TS_PACKET).any(|offset| {
        (0..packets).all(|k| buf.get(offset + k * TS_PACKET) == Some(&TS_SYNC))
    })
}
