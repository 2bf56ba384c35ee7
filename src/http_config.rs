//! HTTP client presets for the source feed, the target calendar API and
//! notification webhooks.

use reqwest::{Client, ClientBuilder};
use std::time::Duration;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Total request timeout
    pub timeout: Duration,
    /// Idle connections kept per host
    pub max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(45),
            max_idle_per_host: 2,
        }
    }
}

impl HttpConfig {
    /// Calendar REST APIs can be slow on list calls
    pub fn calendar_api() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            timeout: Duration::from_secs(90),
            max_idle_per_host: 2,
        }
    }

    /// ICS exports can be large
    pub fn ics_fetch() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            timeout: Duration::from_secs(150),
            max_idle_per_host: 1,
        }
    }

    /// Webhooks should answer quickly; the dispatcher owns retries
    pub fn channel_webhook() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(20),
            max_idle_per_host: 4,
        }
    }

    /// Build a reqwest client with this configuration
    pub fn build_client(&self) -> reqwest::Result<Client> {
        ClientBuilder::new()
            .connect_timeout(self.connect_timeout)
            .timeout(self.timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(self.max_idle_per_host)
            .user_agent(concat!("eventrelay/", env!("CARGO_PKG_VERSION")))
            .build()
    }
}
