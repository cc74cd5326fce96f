//! Announces the bound identity to the server over an active transport.

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::config::ManagerConfig;
use crate::error::TransportError;
use crate::transport::Transport;

/// Sends the identity token as a single method invocation.
///
/// Failures are logged here and handed back to the caller as a value; they
/// never panic and never tear the link down.
#[derive(Debug, Clone)]
pub struct IdentityRegistrar {
    method: String,
    timeout: Duration,
    retries: u32,
    backoff: BackoffPolicy,
}

impl IdentityRegistrar {
    pub fn new(method: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: method.into(),
            timeout,
            retries: 0,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Build from the manager configuration.
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(config.registration_method.clone(), config.registration_timeout())
            .with_retries(config.registration_retries, BackoffPolicy::new(config.backoff))
    }

    /// Retry a failed registration up to `retries` more times.
    pub fn with_retries(mut self, retries: u32, backoff: BackoffPolicy) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Announce `identity` on `transport`.
    pub async fn register(
        &self,
        transport: &dyn Transport,
        identity: &str,
    ) -> Result<(), TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.try_once(transport, identity).await {
                Ok(()) => {
                    tracing::info!(identity, method = %self.method, "identity registered");
                    return Ok(());
                }
                Err(e) if attempt < self.retries && e.is_retryable() => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        identity,
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "identity registration failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(identity, error = %e, "identity registration failed");
                    return Err(e);
                }
            }
        }
    }

    async fn try_once(
        &self,
        transport: &dyn Transport,
        identity: &str,
    ) -> Result<(), TransportError> {
        let payload = serde_json::Value::String(identity.to_string());
        match tokio::time::timeout(self.timeout, transport.send(&self.method, payload)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}
