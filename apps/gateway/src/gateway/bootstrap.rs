//! Cluster bootstrap
//!
//! One authenticated call at startup tells us where to connect, how many
//! shards the remote suggests, and how many identifies may run concurrently.

use crate::error::GatewayError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Identify budget reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: Duration,
    pub max_concurrency: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[async_trait]
pub trait Bootstrap: Send + Sync {
    async fn fetch(&self) -> Result<BootstrapInfo, GatewayError>;
}

/// Asks the REST API (`GET /gateway/bot`) through twilight-http.
pub struct DiscordBootstrap {
    client: twilight_http::Client,
}

impl DiscordBootstrap {
    pub fn new(token: String, proxy: Option<String>) -> Self {
        let mut builder = twilight_http::Client::builder().token(token);
        if let Some(proxy) = proxy {
            builder = builder.proxy(proxy, true);
        }
        Self {
            client: builder.build(),
        }
    }
}

#[async_trait]
impl Bootstrap for DiscordBootstrap {
    async fn fetch(&self) -> Result<BootstrapInfo, GatewayError> {
        let info = self
            .client
            .gateway()
            .authed()
            .await
            .map_err(|e| GatewayError::BadCredential(Box::new(e)))?
            .model()
            .await
            .map_err(|e| GatewayError::BadCredential(Box::new(e)))?;

        let limit = info.session_start_limit;
        let info = BootstrapInfo {
            url: info.url,
            shards: info.shards,
            session_start_limit: SessionStartLimit {
                total: limit.total,
                remaining: limit.remaining,
                reset_after: Duration::from_millis(limit.reset_after),
                max_concurrency: u16::try_from(limit.max_concurrency).unwrap_or(u16::MAX),
            },
        };

        info!(
            url = %info.url,
            shards = info.shards,
            max_concurrency = info.session_start_limit.max_concurrency,
            remaining = info.session_start_limit.remaining,
            "Gateway bootstrap complete"
        );
        Ok(info)
    }
}

/// Fixed bootstrap answer, for tests and offline runs.
#[derive(Debug, Clone)]
pub struct StaticBootstrap(pub BootstrapInfo);

impl StaticBootstrap {
    pub fn new(url: impl Into<String>, shards: u32, max_concurrency: u16) -> Self {
        Self(BootstrapInfo {
            url: url.into(),
            shards,
            session_start_limit: SessionStartLimit {
                total: 1000,
                remaining: 1000,
                reset_after: Duration::ZERO,
                max_concurrency,
            },
        })
    }
}

#[async_trait]
impl Bootstrap for StaticBootstrap {
    async fn fetch(&self) -> Result<BootstrapInfo, GatewayError> {
        Ok(self.0.clone())
    }
}
