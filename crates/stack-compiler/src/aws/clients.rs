//! AWS SDK client bundle.

use aws_config::{BehaviorVersion, Region};

/// Route 53, ACM and ELBv2 clients sharing one [`aws_config::SdkConfig`], so
/// credentials are resolved once.
#[derive(Clone)]
pub struct AwsClients {
    /// Hosted zone lookup and record upserts.
    pub route53: aws_sdk_route53::Client,
    /// Certificate requests and status.
    pub acm: aws_sdk_acm::Client,
    /// Load balancer lookups.
    pub elb: aws_sdk_elasticloadbalancingv2::Client,
}

impl AwsClients {
    /// Load the standard credential chain for `region`.
    ///
    /// ACM certificates used by a load balancer must live in the balancer's
    /// region; Route 53 is global and ignores it.
    pub async fn init(region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Self {
            route53: aws_sdk_route53::Client::new(&config),
            acm: aws_sdk_acm::Client::new(&config),
            elb: aws_sdk_elasticloadbalancingv2::Client::new(&config),
        }
    }
}
