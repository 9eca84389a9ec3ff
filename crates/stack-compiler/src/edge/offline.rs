//! In-process load balancer directory for dry runs and tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::provider::LoadBalancerDirectory;
use crate::naming::ProviderError;

/// Answers every lookup with a stable name derived from the inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineDirectory;

#[async_trait]
impl LoadBalancerDirectory for OfflineDirectory {
    async fn dns_name(&self, name: &str, region: &str) -> Result<String, ProviderError> {
        let mut hasher = Sha256::new();
        hasher.update(name);
        hasher.update(region);
        let digest = format!("{:x}", hasher.finalize());
        Ok(format!("{name}-{}.elb.{region}.amazonaws.com", &digest[..16]))
    }
}
