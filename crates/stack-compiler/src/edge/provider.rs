use async_trait::async_trait;

use crate::naming::ProviderError;

/// Where the load balancer's network identity comes from.
///
/// The DNS record targets whatever this returns, so a live build never points a
/// name at a load balancer that does not exist.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoadBalancerDirectory: Send + Sync {
    /// DNS name of the load balancer called `name` in `region`.
    async fn dns_name(&self, name: &str, region: &str) -> Result<String, ProviderError>;
}
