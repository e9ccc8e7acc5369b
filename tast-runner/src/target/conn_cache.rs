// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The connection cache: at most one healthy session, recovered on demand.
//!
//! The cache moves through `Fresh -> Connected -> (Unhealthy -> Reconnecting
//! -> Connected | Rebooting -> Connected) -> Closed`; only `Closed` is
//! terminal. The transient states exist only inside [`ConnectionCache::
//! ensure_healthy`]: between calls the cache is always `Fresh`, `Connected`,
//! or `Closed`, and [`ConnectionCache::current`] keeps returning the
//! pre-reconnect session until a replacement is installed.

use crate::{
    config::SshConfig,
    errors::ConnectionError,
    logging::Logger,
    target::{SshSession, TargetEndpoint},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Connect budget when a reboot helper is available.
const TIMEOUT_WITH_REBOOT: Duration = Duration::from_secs(5 * 60);

/// Connect budget without a reboot helper.
const TIMEOUT_WITHOUT_REBOOT: Duration = Duration::from_secs(60);

/// A mechanism for hard-rebooting an unreachable target, e.g. a lab power
/// cycler.
#[async_trait]
pub trait RebootHelper: Send + Sync {
    /// Triggers a reboot. Failure is logged by the caller but is not fatal:
    /// a subsequent connect may still succeed.
    async fn reboot(&self, logger: &Logger) -> Result<(), ConnectionError>;
}

/// A reboot helper that asks the target itself to reboot over a one-shot SSH
/// connection. The remote `reboot` may block indefinitely, so the request
/// uses a short deadline and ignores the outcome.
#[derive(Debug)]
pub struct SshRebootHelper {
    endpoint: TargetEndpoint,
    config: SshConfig,
}

impl SshRebootHelper {
    /// Creates a helper for the given target.
    pub fn new(endpoint: TargetEndpoint, config: SshConfig) -> Self {
        Self { endpoint, config }
    }
}

#[async_trait]
impl RebootHelper for SshRebootHelper {
    async fn reboot(&self, logger: &Logger) -> Result<(), ConnectionError> {
        let session = SshSession::connect(&self.endpoint, &self.config, logger).await?;
        session.request_reboot(logger).await;
        session.close().await;
        Ok(())
    }
}

#[derive(Debug)]
enum CacheState {
    Fresh,
    Connected(Arc<SshSession>),
    Closed,
}

/// Manages one cached connection to the target, replacing it when it goes
/// unhealthy.
///
/// Single-writer: only the run thread mutates the cache. Handles returned by
/// [`current`](Self::current) and [`ensure_healthy`](Self::ensure_healthy)
/// are invalidated by the next `ensure_healthy` call: the old session's
/// control master is torn down, so operations on a stale handle fail fast.
pub struct ConnectionCache {
    endpoint: TargetEndpoint,
    config: SshConfig,
    reboot_helper: Option<Box<dyn RebootHelper>>,
    logger: Logger,
    state: CacheState,
    initial_fingerprint: Option<String>,
}

impl ConnectionCache {
    /// Creates a cache for `endpoint`. No connection is made until the first
    /// [`ensure_healthy`](Self::ensure_healthy) call.
    pub fn new(
        endpoint: TargetEndpoint,
        config: SshConfig,
        reboot_helper: Option<Box<dyn RebootHelper>>,
        logger: Logger,
    ) -> Self {
        Self {
            endpoint,
            config,
            reboot_helper,
            logger,
            state: CacheState::Fresh,
            initial_fingerprint: None,
        }
    }

    /// The endpoint this cache connects to.
    pub fn connection_spec(&self) -> &TargetEndpoint {
        &self.endpoint
    }

    /// The boot fingerprint captured on the first successful connect, if
    /// any. A different fingerprint on a later connect means the target
    /// rebooted in between.
    pub fn initial_fingerprint(&self) -> Option<&str> {
        self.initial_fingerprint.as_deref()
    }

    /// The total connect budget used after a failed reconnect.
    pub fn default_timeout(&self) -> Duration {
        if self.reboot_helper.is_some() {
            TIMEOUT_WITH_REBOOT
        } else {
            TIMEOUT_WITHOUT_REBOOT
        }
    }

    /// Returns the currently cached session without checking its health.
    /// May be stale; never fails once a connection was ever established.
    pub fn current(&self) -> Option<Arc<SshSession>> {
        match &self.state {
            CacheState::Connected(session) => Some(session.clone()),
            CacheState::Fresh | CacheState::Closed => None,
        }
    }

    /// Returns a session guaranteed healthy at call time, reconnecting or
    /// rebooting as needed. On failure the cache is left closed and the run
    /// cannot continue.
    pub async fn ensure_healthy(&mut self) -> Result<Arc<SshSession>, ConnectionError> {
        match &self.state {
            CacheState::Closed => return Err(ConnectionError::Closed),
            CacheState::Connected(session) => match session.ping().await {
                Ok(()) => return Ok(session.clone()),
                Err(error) => {
                    self.logger
                        .info(format!("Connection to {} unhealthy: {error}", self.endpoint));
                }
            },
            CacheState::Fresh => {}
        }

        // Close the old session best-effort before replacing it.
        if let CacheState::Connected(old) = std::mem::replace(&mut self.state, CacheState::Fresh) {
            old.close().await;
        }

        let session = match self.reconnect().await {
            Ok(session) => session,
            Err(error) => {
                self.state = CacheState::Closed;
                return Err(error);
            }
        };

        match session.read_boot_fingerprint().await {
            Ok(fingerprint) => match &self.initial_fingerprint {
                None => self.initial_fingerprint = Some(fingerprint),
                Some(initial) if *initial != fingerprint => {
                    self.logger
                        .info(format!("Target {} rebooted since first connect", self.endpoint));
                }
                Some(_) => {}
            },
            Err(error) => {
                warn!(%error, "failed to read boot fingerprint");
            }
        }

        let session = Arc::new(session);
        self.state = CacheState::Connected(session.clone());
        Ok(session)
    }

    /// Closes the cache. Terminal: later `ensure_healthy` calls fail.
    pub async fn close(&mut self) {
        if let CacheState::Connected(session) =
            std::mem::replace(&mut self.state, CacheState::Closed)
        {
            session.close().await;
        }
    }

    async fn reconnect(&mut self) -> Result<SshSession, ConnectionError> {
        match self.connect_with_retries(self.config.connect_retries).await {
            Ok(session) => return Ok(session),
            Err(error) => {
                let Some(helper) = &self.reboot_helper else {
                    return Err(error);
                };
                self.logger.info(format!(
                    "Failed to connect to {}: {error}; rebooting",
                    self.endpoint
                ));
                if let Err(error) = helper.reboot(&self.logger).await {
                    // Not fatal: the reboot may have gone through anyway, or
                    // the target may come back on its own.
                    self.logger.info(format!("Reboot request failed: {error}"));
                }
            }
        }

        // Poll connect for the full post-reboot budget.
        let deadline = Instant::now() + self.default_timeout();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match SshSession::connect(&self.endpoint, &self.config, &self.logger).await {
                Ok(session) => return Ok(session),
                Err(error) => {
                    debug!(%error, attempts, "post-reboot connect attempt failed");
                    if Instant::now() + self.config.retry_interval >= deadline {
                        return Err(ConnectionError::ConnectTimeout {
                            endpoint: self.endpoint.to_string(),
                            attempts,
                        });
                    }
                    tokio::time::sleep(self.config.retry_interval).await;
                }
            }
        }
    }

    async fn connect_with_retries(
        &self,
        attempts: usize,
    ) -> Result<SshSession, ConnectionError> {
        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match SshSession::connect(&self.endpoint, &self.config, &self.logger).await {
                Ok(session) => return Ok(session),
                Err(error) => {
                    debug!(%error, attempt, "connect attempt failed");
                    last_error = Some(error);
                    if attempt != attempts {
                        tokio::time::sleep(self.config.retry_interval).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or(ConnectionError::ConnectTimeout {
            endpoint: self.endpoint.to_string(),
            attempts,
        }))
    }
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("endpoint", &self.endpoint)
            .field(
                "state",
                &match self.state {
                    CacheState::Fresh => "fresh",
                    CacheState::Connected(_) => "connected",
                    CacheState::Closed => "closed",
                },
            )
            .field("has_reboot_helper", &self.reboot_helper.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache(with_helper: bool) -> ConnectionCache {
        let endpoint: TargetEndpoint = "root@dut1".parse().unwrap();
        let helper: Option<Box<dyn RebootHelper>> = with_helper.then(|| {
            Box::new(SshRebootHelper::new(
                endpoint.clone(),
                SshConfig::default(),
            )) as Box<dyn RebootHelper>
        });
        ConnectionCache::new(endpoint, SshConfig::default(), helper, Logger::none())
    }

    #[test]
    fn default_timeout_depends_on_reboot_helper() {
        assert_eq!(cache(true).default_timeout(), Duration::from_secs(300));
        assert_eq!(cache(false).default_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn fresh_cache_has_no_current_connection() {
        let cache = cache(false);
        assert!(cache.current().is_none());
        assert!(cache.initial_fingerprint().is_none());
    }

    #[tokio::test]
    async fn closed_cache_refuses_to_reconnect() {
        let mut cache = cache(false);
        cache.close().await;
        let err = cache.ensure_healthy().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed), "got {err:?}");
    }
}
