use async_trait::async_trait;
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use tracing::debug;

use super::provider_error;
use crate::naming::{DnsProvider, ProviderError, Zone};

/// [`DnsProvider`] backed by Route 53 public hosted zones.
#[derive(Clone)]
pub struct Route53Dns {
    client: aws_sdk_route53::Client,
}

impl Route53Dns {
    pub fn new(client: aws_sdk_route53::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DnsProvider for Route53Dns {
    /// Walk from `domain` towards the root and return the first exact zone match.
    async fn lookup_zone(&self, domain: &str) -> Result<Zone, ProviderError> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let labels: Vec<&str> = domain.split('.').collect();

        for start in 0..labels.len().saturating_sub(1) {
            let candidate = labels[start..].join(".");
            let resp = self
                .client
                .list_hosted_zones_by_name()
                .dns_name(&candidate)
                .max_items(1)
                .send()
                .await
                .map_err(provider_error)?;

            if let Some(zone) = resp.hosted_zones().first() {
                let name = zone.name().trim_end_matches('.').to_ascii_lowercase();
                if name == candidate {
                    debug!(zone = zone.id(), name = %name, "hosted zone found");
                    return Ok(Zone {
                        id: zone.id().trim_start_matches("/hostedzone/").to_string(),
                        name,
                    });
                }
            }
        }

        Err(ProviderError::new(
            "NoSuchHostedZone",
            format!("no hosted zone serves {domain}"),
        ))
    }

    async fn upsert_record(
        &self,
        zone: &Zone,
        name: &str,
        target: &str,
        ttl: u32,
    ) -> Result<(), ProviderError> {
        upsert_cname(&self.client, &zone.id, name, target, ttl).await
    }
}

/// UPSERT a single CNAME record.
pub(crate) async fn upsert_cname(
    client: &aws_sdk_route53::Client,
    zone_id: &str,
    name: &str,
    target: &str,
    ttl: u32,
) -> Result<(), ProviderError> {
    let invalid = |e: aws_sdk_route53::error::BuildError| ProviderError::new("InvalidInput", e.to_string());

    let record_set = ResourceRecordSet::builder()
        .name(name)
        .r#type(RrType::Cname)
        .ttl(i64::from(ttl))
        .resource_records(ResourceRecord::builder().value(target).build().map_err(invalid)?)
        .build()
        .map_err(invalid)?;
    let change = Change::builder()
        .action(ChangeAction::Upsert)
        .resource_record_set(record_set)
        .build()
        .map_err(invalid)?;
    let batch = ChangeBatch::builder().changes(change).build().map_err(invalid)?;

    client
        .change_resource_record_sets()
        .hosted_zone_id(zone_id)
        .change_batch(batch)
        .send()
        .await
        .map_err(provider_error)?;

    debug!(zone = zone_id, name, target, "record upserted");
    Ok(())
}
