//! The outer reverse-connection loop.
//!
//! Keeps one channel to the primary broker alive: loads the broker set,
//! locates the current owner, runs a [`Connection`] to completion, then
//! decides whether to reconnect, rediscover the owner, or reload the check
//! bundle. Exits only on cancellation or a fatal error.

use crate::connection::{Connection, ConnectionOpts};
use crate::error::OpError;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemon_check::{CheckMeta, Resolver, ReverseConfigs};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ReverseOpts {
    /// When false the supervisor logs and exits immediately.
    pub enabled: bool,
    pub max_backoff: Duration,
    pub refresh_interval: Duration,
    pub dispatch_timeout: Duration,
}

impl Default for ReverseOpts {
    fn default() -> Self {
        Self {
            enabled: false,
            max_backoff: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(300),
            dispatch_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Reverse {
    agent_address: String,
    resolver: Arc<dyn Resolver>,
    opts: ReverseOpts,
    configs: ReverseConfigs,
    meta: Option<CheckMeta>,
}

impl std::fmt::Debug for Reverse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reverse")
            .field("agent_address", &self.agent_address)
            .field("resolver", &"<dyn Resolver>")
            .field("opts", &self.opts)
            .field("configs", &self.configs)
            .field("meta", &self.meta)
            .finish()
    }
}

impl Reverse {
    /// Fails fast on an empty agent address or, when enabled, on a resolver
    /// that cannot produce an initial configuration set.
    pub fn new(
        resolver: Arc<dyn Resolver>,
        agent_address: impl Into<String>,
        opts: ReverseOpts,
    ) -> Result<Self, OpError> {
        let agent_address = agent_address.into();
        if agent_address.is_empty() {
            return Err(OpError::Fatal("invalid agent address (empty)".to_string()));
        }

        if !opts.enabled {
            return Ok(Self {
                agent_address,
                resolver,
                opts,
                configs: ReverseConfigs::new(),
                meta: None,
            });
        }

        let configs = resolver
            .reverse_configs()
            .map_err(|e| OpError::Fatal(format!("getting reverse configurations: {e}")))?;
        let meta = resolver
            .metadata()
            .map_err(|e| OpError::Fatal(format!("getting check metadata: {e}")))?;

        Ok(Self {
            agent_address,
            resolver,
            opts,
            configs,
            meta: Some(meta),
        })
    }

    pub async fn start(&mut self, token: CancellationToken) -> Result<(), OpError> {
        if !self.opts.enabled {
            tracing::info!("reverse connection disabled, not starting");
            return Ok(());
        }
        if self.configs.is_empty() {
            return Err(OpError::Fatal(
                "no reverse configurations for check".to_string(),
            ));
        }
        if let Some(meta) = &self.meta {
            tracing::info!(
                bundle_cid = %meta.bundle_id,
                check_cid = %meta.check_id,
                check_uuid = %meta.check_uuid,
                "starting reverse connection supervisor"
            );
        }

        let mut last_refresh = Instant::now();
        let mut refresh_due = jittered(self.opts.refresh_interval);
        let mut refresh_check = false;
        // Set when the primary CN was absent from a freshly refreshed set;
        // a second consecutive miss means the bundle itself is unresolvable.
        let mut cn_missing_after_refresh = false;

        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            if last_refresh.elapsed() > refresh_due {
                refresh_check = true;
            }

            if refresh_check {
                tracing::debug!("refreshing check bundle");
                let refreshed = tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    res = self.resolver.refresh_reverse_config() => res,
                };
                refreshed.map_err(|e| {
                    OpError::Fatal(format!("refreshing reverse configuration: {e}"))
                })?;
                self.configs = self
                    .resolver
                    .reverse_configs()
                    .map_err(|e| OpError::Fatal(format!("getting reverse configurations: {e}")))?;
                if self.configs.is_empty() {
                    return Err(OpError::Fatal(
                        "refresh produced no reverse configurations".to_string(),
                    ));
                }
                last_refresh = Instant::now();
                refresh_due = jittered(self.opts.refresh_interval);
                refresh_check = false;
            }

            let found = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                res = self.resolver.find_primary(&self.configs) => res,
            };
            let primary_cn = match found {
                Ok(cn) => cn,
                Err(e) if e.is_no_owner() => {
                    tracing::warn!(error = %e, "no broker owner, refreshing check bundle");
                    refresh_check = true;
                    continue;
                }
                Err(e) => {
                    return Err(OpError::Fatal(format!("finding primary broker: {e}")));
                }
            };

            let config = match self.configs.get(&primary_cn) {
                Some(config) => {
                    cn_missing_after_refresh = false;
                    config.clone()
                }
                None if cn_missing_after_refresh => {
                    return Err(OpError::Fatal(format!(
                        "primary broker CN '{primary_cn}' still unresolvable after refresh"
                    )));
                }
                None => {
                    tracing::warn!(primary = %primary_cn, "primary broker CN not in configs, refreshing check");
                    refresh_check = true;
                    cn_missing_after_refresh = true;
                    continue;
                }
            };

            tracing::info!(
                broker = %config.broker_id,
                cn = %config.cn,
                address = %config.address,
                url = %config.reverse_url,
                "reverse broker config"
            );

            let check_uuid = self
                .meta
                .as_ref()
                .map(|m| m.check_uuid.clone())
                .unwrap_or_default();
            let mut connection = Connection::new(
                config,
                check_uuid,
                self.agent_address.clone(),
                ConnectionOpts {
                    dispatch_timeout: self.opts.dispatch_timeout,
                    max_backoff: self.opts.max_backoff,
                },
            )?;

            // One connection at a time, in its own task so this loop's
            // cancellation stays prompt (the child token ends the task).
            let child = token.child_token();
            let handle = tokio::spawn(async move { connection.start(child).await });
            match handle.await {
                Ok(Ok(())) => {
                    tracing::debug!("reverse connection finished");
                }
                Ok(Err(e)) => match e {
                    OpError::Fatal(_) => return Err(e),
                    OpError::RefreshCheck(msg) => {
                        tracing::warn!(error = %msg, "reverse connection needs refresh");
                        refresh_check = true;
                    }
                    OpError::Retry(msg) => {
                        tracing::warn!(error = %msg, "reverse connection retrying");
                    }
                },
                Err(e) => {
                    return Err(OpError::Fatal(format!("reverse connection task: {e}")));
                }
            }
        }
    }
}

/// Refresh cadence with small spread so a fleet of agents does not hit the
/// management API in lockstep.
fn jittered(interval: Duration) -> Duration {
    let cap = (interval / 10).min(Duration::from_secs(30));
    let cap_ms = cap.as_millis() as i64;
    if cap_ms == 0 {
        return interval;
    }
    let offset = rand::thread_rng().gen_range(-cap_ms..=cap_ms);
    if offset >= 0 {
        interval + Duration::from_millis(offset as u64)
    } else {
        interval.saturating_sub(Duration::from_millis(offset.unsigned_abs()))
    }
}
