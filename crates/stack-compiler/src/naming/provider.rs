use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// A hosted DNS zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Zone {
    pub id: String,
    /// Apex domain without a trailing dot.
    pub name: String,
}

/// Request rejected by the DNS provider or certificate authority.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// What the authority reports for a DNS challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationStatus {
    Issued,
    Pending,
    Failed(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn lookup_zone(&self, domain: &str) -> Result<Zone, ProviderError>;

    /// Create or replace the CNAME `name` → `target`. Keyed by (zone, name).
    async fn upsert_record(
        &self,
        zone: &Zone,
        name: &str,
        target: &str,
        ttl: u32,
    ) -> Result<(), ProviderError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Start DNS validation for `name`, returning the authority's certificate handle.
    async fn request(&self, name: &str, zone: &Zone) -> Result<String, ProviderError>;

    async fn validate(&self, certificate: &str, zone: &Zone) -> Result<ValidationStatus, ProviderError>;
}
