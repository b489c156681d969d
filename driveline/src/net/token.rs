//! Access-token fetch from the external token manager. The token doubles as
//! the MQTT password; a CONNACK auth failure invalidates it and the reconnect
//! path fetches a fresh one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::Config;
use crate::lifecycle::ShutdownSignal;

const MAX_BACKOFF_SECS: u64 = 128;

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

pub struct TokenClient {
    url: String,
    agent: ureq::Agent,
    cached: Mutex<Option<String>>,
}

impl TokenClient {
    /// `None` when no token manager is configured; static credentials are
    /// used instead.
    pub fn from_config(config: &Config) -> Option<Arc<TokenClient>> {
        let url = config.get_string("auth.tokenUrl", "");
        if url.is_empty() {
            return None;
        }

        let connector = Arc::new(
            native_tls::TlsConnector::new().expect("Unable to build TLS connector"),
        );
        let agent = ureq::AgentBuilder::new()
            .tls_connector(connector)
            .timeout(Duration::from_secs(30))
            .build();

        Some(Arc::new(TokenClient {
            url,
            agent,
            cached: Mutex::new(None),
        }))
    }

    /// Fetches a token, retrying with exponential backoff. Honors the
    /// shutdown signal and the stop token for prompt exit; returns `None`
    /// when interrupted.
    pub async fn token_with_backoff(
        &self,
        signal: &ShutdownSignal,
        stop: &tokio_util::sync::CancellationToken,
    ) -> Option<String> {
        if let Some(token) = self.cached.lock().expect("token lock poisoned").clone() {
            return Some(token);
        }

        let mut backoff_secs = 2u64;
        loop {
            if signal.is_notified() || stop.is_cancelled() {
                return None;
            }

            match self.fetch() {
                Ok(token) => {
                    *self.cached.lock().expect("token lock poisoned") = Some(token.clone());
                    return Some(token);
                }
                Err(e) => {
                    log::warn!("Token fetch failed, retrying in {backoff_secs}s: {e}");
                    tokio::select! {
                        _ = signal.notified() => return None,
                        _ = stop.cancelled() => return None,
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    fn fetch(&self) -> Result<String> {
        let response: TokenResponse = self
            .agent
            .get(&self.url)
            .call()
            .context("Token manager request failed")?
            .into_json()
            .context("Token manager response is not the expected JSON")?;
        Ok(response.token)
    }

    /// Drops the cached token so the next connect fetches a fresh one.
    pub fn invalidate(&self) {
        log::info!("Invalidating cached access token");
        *self.cached.lock().expect("token lock poisoned") = None;
    }

    #[cfg(test)]
    pub(crate) fn seed_for_test(&self, token: &str) {
        *self.cached.lock().expect("token lock poisoned") = Some(token.to_owned());
    }
}
