use crate::breaker::CircuitBreaker;
use crate::urlpolicy::UrlPolicy;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Named channel group provided by the receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bouquet {
    pub name: String,
    pub service_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerEntry {
    pub service_ref: String,
    pub name: String,
    pub begin: i64,
    pub end: i64,
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpgEvent {
    pub id: u64,
    pub service_ref: String,
    pub title: String,
    pub begin: i64,
    pub duration_secs: u32,
    pub description: String,
}

/// Upstream set-top receiver, reduced to the operations the gateway needs.
/// The wire protocol behind it is not this crate's business.
#[async_trait]
pub trait ReceiverClient: Send + Sync {
    /// Turn a service reference into a playable upstream URL
    async fn resolve_stream_url(&self, service_ref: &str) -> Result<Url>;

    /// Ask the receiver to prepare a tuner slot; advisory
    async fn tune_slot(&self, slot: u32) -> Result<()>;

    async fn bouquets(&self) -> Result<Vec<Bouquet>>;

    async fn timers(&self) -> Result<Vec<TimerEntry>>;

    async fn epg(&self, service_ref: &str) -> Result<Vec<EpgEvent>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Web interface base, e.g. `http://receiver.lan`
    pub base_url: String,
    /// Port the receiver streams services on
    pub stream_port: u16,
    /// Request timeout against the web interface
    pub timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://receiver.lan".to_string(),
            stream_port: 8_001,
            timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP client against the receiver's web interface. Every call runs
/// under the shared circuit breaker; the stream URL itself is built
/// locally from the configured streaming port.
pub struct HttpReceiverClient {
    base: Url,
    stream_port: u16,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    policy: Arc<UrlPolicy>,
}

impl HttpReceiverClient {
    pub fn new(
        cfg: &ReceiverConfig,
        breaker: Arc<CircuitBreaker>,
        policy: Arc<UrlPolicy>,
    ) -> Result<Self> {
        let base: Url = cfg
            .base_url
            .parse()
            .with_context(|| format!("bad receiver base url: {}", cfg.base_url))?;
        policy
            .validate(&base)
            .map_err(|e| anyhow!("receiver base url refused: {e}"))?;
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            base,
            stream_port: cfg.stream_port,
            http,
            breaker,
            policy,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base.join(path)?;
        self.policy
            .validate(&url)
            .map_err(|e| anyhow!("receiver url refused: {e}"))?;
        self.breaker
            .call(|| async {
                let resp = self.http.get(url.clone()).send().await?;
                let resp = resp.error_for_status()?;
                Ok(resp.json::<T>().await?)
            })
            .await
    }
}

#[derive(Debug, Deserialize)]
struct BouquetList {
    bouquets: Vec<Bouquet>,
}

#[derive(Debug, Deserialize)]
struct TimerList {
    timers: Vec<TimerEntry>,
}

#[derive(Debug, Deserialize)]
struct EpgList {
    events: Vec<EpgEvent>,
}

#[async_trait]
impl ReceiverClient for HttpReceiverClient {
    async fn resolve_stream_url(&self, service_ref: &str) -> Result<Url> {
        let host = self
            .base
            .host_str()
            .ok_or_else(|| anyhow!("receiver base url has no host"))?;
        let url: Url = format!("http://{}:{}/{}", host, self.stream_port, service_ref)
            .parse()
            .context("failed to build stream url")?;
        debug!(service_ref, url = %url, "resolved stream url");
        Ok(url)
    }

    async fn tune_slot(&self, slot: u32) -> Result<()> {
        let _: serde_json::Value = self
            .get_json(&format!("api/tune?slot={slot}"))
            .await
            .with_context(|| format!("failed to tune slot {slot}"))?;
        Ok(())
    }

    async fn bouquets(&self) -> Result<Vec<Bouquet>> {
        let list: BouquetList = self.get_json("api/bouquets").await?;
        Ok(list.bouquets)
    }

    async fn timers(&self) -> Result<Vec<TimerEntry>> {
        let list: TimerList = self.get_json("api/timerlist").await?;
        Ok(list.timers)
    }

    async fn epg(&self, service_ref: &str) -> Result<Vec<EpgEvent>> {
        let list: EpgList = self
            .get_json(&format!("api/epgservice?sRef={service_ref}"))
            .await?;
        Ok(list.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn client() -> HttpReceiverClient {
        let clock = Arc::new(SystemClock::new());
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(30), clock));
        HttpReceiverClient::new(
            &ReceiverConfig::default(),
            breaker,
            Arc::new(UrlPolicy::permissive()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stream_url_uses_streaming_port_and_reference_path() {
        let c = client();
        let url = c
            .resolve_stream_url("1:0:19:2B66:3F3:1:C00000:0:0:0:")
            .await
            .unwrap();
        assert_eq!(url.port(), Some(8001));
        assert_eq!(url.path(), "/1:0:19:2B66:3F3:1:C00000:0:0:0:");
    }

    #[test]
    fn loopback_receiver_base_is_refused() {
        let clock = Arc::new(SystemClock::new());
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(30), clock));
        let cfg = ReceiverConfig {
            base_url: "http://127.0.0.1".to_string(),
            ..Default::default()
        };
        assert!(
            HttpReceiverClient::new(&cfg, breaker, Arc::new(UrlPolicy::permissive())).is_err()
        );
    }
}
