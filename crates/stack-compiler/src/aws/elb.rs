use async_trait::async_trait;
use tracing::debug;

use super::provider_error;
use crate::edge::LoadBalancerDirectory;
use crate::naming::ProviderError;

/// [`LoadBalancerDirectory`] that looks up an existing Elastic Load Balancing v2
/// load balancer by name. The build never invents a target for a live record.
#[derive(Clone)]
pub struct ElbDirectory {
    client: aws_sdk_elasticloadbalancingv2::Client,
}

impl ElbDirectory {
    pub fn new(client: aws_sdk_elasticloadbalancingv2::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LoadBalancerDirectory for ElbDirectory {
    async fn dns_name(&self, name: &str, region: &str) -> Result<String, ProviderError> {
        let resp = self
            .client
            .describe_load_balancers()
            .names(name)
            .send()
            .await
            .map_err(provider_error)?;

        let dns_name = resp
            .load_balancers()
            .first()
            .and_then(|lb| lb.dns_name())
            .ok_or_else(|| {
                ProviderError::new(
                    "LoadBalancerNotFound",
                    format!("no load balancer named {name} in {region}"),
                )
            })?;
        debug!(load_balancer = name, dns_name, "load balancer found");
        Ok(dns_name.to_string())
    }
}
