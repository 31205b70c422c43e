use crate::broker::{CheckMeta, ReverseConfigs};
use crate::error::Result;
use async_trait::async_trait;

/// What the reverse supervisor needs from the check/broker layer.
///
/// `reverse_configs` and `metadata` answer from cache;
/// `refresh_reverse_config` and `find_primary` go to the network.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// The current broker configuration set for this check.
    fn reverse_configs(&self) -> Result<ReverseConfigs>;

    /// Reload the check bundle and broker records, replacing the cached
    /// configuration set wholesale.
    async fn refresh_reverse_config(&self) -> Result<()>;

    /// CN of the broker currently designated to serve the check.
    /// `ResolverError::NoOwnerFound` is a transient outcome, not a failure.
    async fn find_primary(&self, configs: &ReverseConfigs) -> Result<String>;

    /// Identity of the check this agent reports under.
    fn metadata(&self) -> Result<CheckMeta>;
}
