//! In-process DNS provider and certificate authority.
//!
//! Used for dry runs and tests. State lives behind tokio locks so the types can
//! be shared the same way the AWS-backed collaborators are.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::provider::{CertificateAuthority, DnsProvider, ProviderError, ValidationStatus, Zone};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    pub target: String,
    pub ttl: u32,
}

/// Hosted zones known up front; records upserted in memory.
#[derive(Debug, Default)]
pub struct OfflineDns {
    zones: Vec<Zone>,
    records: RwLock<BTreeMap<(String, String), RecordEntry>>,
}

impl OfflineDns {
    pub fn with_zone(domain: &str) -> Self {
        let name = domain.trim_end_matches('.').to_ascii_lowercase();
        Self {
            zones: vec![Zone {
                id: format!("offline-{name}"),
                name,
            }],
            records: RwLock::default(),
        }
    }

    pub async fn record(&self, zone: &Zone, name: &str) -> Option<RecordEntry> {
        self.records
            .read()
            .await
            .get(&(zone.id.clone(), name.to_string()))
            .cloned()
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl DnsProvider for OfflineDns {
    async fn lookup_zone(&self, domain: &str) -> Result<Zone, ProviderError> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        self.zones
            .iter()
            .filter(|z| domain == z.name || domain.ends_with(&format!(".{}", z.name)))
            .max_by_key(|z| z.name.len())
            .cloned()
            .ok_or_else(|| ProviderError::new("NoSuchHostedZone", format!("no hosted zone for {domain}")))
    }

    async fn upsert_record(
        &self,
        zone: &Zone,
        name: &str,
        target: &str,
        ttl: u32,
    ) -> Result<(), ProviderError> {
        if !self.zones.contains(zone) {
            return Err(ProviderError::new("NoSuchHostedZone", format!("unknown zone {}", zone.id)));
        }
        self.records.write().await.insert(
            (zone.id.clone(), name.to_string()),
            RecordEntry {
                target: target.to_string(),
                ttl,
            },
        );
        debug!(zone = %zone.id, name, target, ttl, "record upserted");
        Ok(())
    }
}

/// How an [`OfflineAuthority`] answers validation polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issuance {
    /// Issued on the first poll; the zone is already validated.
    Immediate,
    /// Pending for the given number of polls, then issued.
    AfterPolls(u32),
    /// Pending forever.
    Never,
    /// The challenge fails with the given reason.
    Fails(String),
}

#[derive(Debug)]
pub struct OfflineAuthority {
    issuance: Issuance,
    polls: AtomicU32,
}

impl OfflineAuthority {
    pub fn new(issuance: Issuance) -> Self {
        Self {
            issuance,
            polls: AtomicU32::new(0),
        }
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for OfflineAuthority {
    async fn request(&self, name: &str, zone: &Zone) -> Result<String, ProviderError> {
        Ok(format!("offline-cert/{}/{name}", zone.id))
    }

    async fn validate(&self, _certificate: &str, _zone: &Zone) -> Result<ValidationStatus, ProviderError> {
        let seen = self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(match &self.issuance {
            Issuance::Immediate => ValidationStatus::Issued,
            Issuance::AfterPolls(n) if seen >= *n => ValidationStatus::Issued,
            Issuance::AfterPolls(_) | Issuance::Never => ValidationStatus::Pending,
            Issuance::Fails(reason) => ValidationStatus::Failed(reason.clone()),
        })
    }
}
