//! Identity and naming: the DNS record for the load balancer and the TLS
//! certificate bound to the same name.
//!
//! Waiting for certificate issuance is the only suspension point in a build. It
//! is a bounded poll with explicit cancellation; when the bound elapses the
//! whole build is abandoned.

pub mod offline;
pub mod provider;

use std::time::Duration;

use common::{ResourceId, Result, TopologyError};
use serde::Serialize;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use provider::{CertificateAuthority, DnsProvider, ProviderError, ValidationStatus, Zone};

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecord {
    pub id: ResourceId,
    pub zone: String,
    pub name: String,
    pub record_type: String,
    pub target: String,
    pub ttl: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateState {
    Requested,
    PendingValidation,
    Issued,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Certificate {
    pub id: ResourceId,
    /// The authority's handle (an ARN for ACM).
    pub handle: String,
    pub domain_name: String,
    pub zone: String,
    pub state: CertificateState,
}

impl Certificate {
    pub fn is_issued(&self) -> bool {
        self.state == CertificateState::Issued
    }
}

/// Bound on the certificate wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

/// `record_name` relative to `zone`, or unchanged when already inside it.
pub fn qualify(record_name: &str, zone: &str) -> String {
    let record_name = record_name.trim_end_matches('.').to_ascii_lowercase();
    let zone = zone.trim_end_matches('.').to_ascii_lowercase();
    if record_name == zone || record_name.ends_with(&format!(".{zone}")) {
        record_name
    } else {
        format!("{record_name}.{zone}")
    }
}

/// Check a hostname against DNS label rules.
pub fn validate_hostname(entity: &str, name: &str) -> Result<()> {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(TopologyError::validation(
            entity,
            format!("name {name:?} must be 1-{MAX_NAME_LEN} characters"),
        ));
    }
    for label in name.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(TopologyError::validation(
                entity,
                format!("label {label:?} of {name:?} is not a valid DNS label"),
            ));
        }
    }
    Ok(())
}

/// Find the hosted zone serving `domain`.
pub async fn lookup_zone(dns: &dyn DnsProvider, domain: &str) -> Result<Zone> {
    let entity = format!("zone-{domain}");
    validate_hostname(&entity, domain)?;
    let zone = dns
        .lookup_zone(domain)
        .await
        .map_err(|e| TopologyError::substrate(&entity, e.code, e.message))?;
    debug!(zone = %zone.id, name = %zone.name, "zone resolved");
    Ok(zone)
}

/// Upsert a CNAME `record_name` → `target` in `zone`.
///
/// Idempotent: rebinding the same (zone, name) replaces the target and ttl.
pub async fn bind_name(
    dns: &dyn DnsProvider,
    zone: &Zone,
    record_name: &str,
    target: &str,
    ttl: u32,
) -> Result<DnsRecord> {
    let name = qualify(record_name, &zone.name);
    let id = ResourceId::new(format!("record-{name}"));

    validate_hostname(id.as_str(), &name)?;
    validate_hostname(id.as_str(), target)?;
    if ttl == 0 {
        return Err(TopologyError::validation(id.as_str(), "ttl must be positive"));
    }

    dns.upsert_record(zone, &name, target, ttl)
        .await
        .map_err(|e| TopologyError::substrate(id.as_str(), e.code, e.message))?;

    info!(record = %name, target, ttl, "dns record bound");
    Ok(DnsRecord {
        id,
        zone: zone.id.clone(),
        name,
        record_type: "CNAME".to_string(),
        target: target.to_string(),
        ttl,
    })
}

/// Ask the authority for a certificate, validated through `zone`.
///
/// Returns the certificate in [`CertificateState::PendingValidation`].
pub async fn request_certificate(
    ca: &dyn CertificateAuthority,
    name: &str,
    zone: &Zone,
) -> Result<Certificate> {
    let domain_name = name.trim_end_matches('.').to_ascii_lowercase();
    let id = ResourceId::new(format!("cert-{domain_name}"));

    validate_hostname(id.as_str(), &domain_name)?;
    if qualify(&domain_name, &zone.name) != domain_name {
        return Err(TopologyError::config(
            id.as_str(),
            format!("{domain_name} cannot be validated through zone {}", zone.name),
        ));
    }

    let mut certificate = Certificate {
        id,
        handle: String::new(),
        domain_name,
        zone: zone.id.clone(),
        state: CertificateState::Requested,
    };
    certificate.handle = ca
        .request(&certificate.domain_name, zone)
        .await
        .map_err(|e| TopologyError::substrate(certificate.id.as_str(), e.code, e.message))?;
    certificate.state = CertificateState::PendingValidation;

    info!(certificate = %certificate.id, handle = %certificate.handle, "certificate requested");
    Ok(certificate)
}

enum WaitOutcome {
    Issued,
    Rejected(TopologyError),
    Elapsed,
    Cancelled,
}

/// Poll the authority until `certificate` is issued.
///
/// # Errors
///
/// - [`TopologyError::Validation`] for a zero poll interval.
/// - [`TopologyError::Substrate`] when the challenge fails or the authority errors.
/// - [`TopologyError::Timeout`] when `policy.timeout` elapses (`cancel` is then
///   cancelled to abandon the build) or `cancel` fires from elsewhere.
pub async fn await_issued(
    ca: &dyn CertificateAuthority,
    zone: &Zone,
    mut certificate: Certificate,
    policy: WaitPolicy,
    cancel: &CancellationToken,
) -> Result<Certificate> {
    if certificate.is_issued() {
        return Ok(certificate);
    }

    let entity = certificate.id.to_string();
    if policy.poll_interval.is_zero() {
        return Err(TopologyError::validation(entity, "poll interval must be > 0"));
    }
    let handle = certificate.handle.clone();
    let poll = async {
        let mut ticker = time::interval(policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match ca.validate(&handle, zone).await {
                Ok(ValidationStatus::Issued) => return WaitOutcome::Issued,
                Ok(ValidationStatus::Pending) => debug!(certificate = %entity, "validation pending"),
                Ok(ValidationStatus::Failed(reason)) => {
                    return WaitOutcome::Rejected(TopologyError::substrate(&entity, "ValidationFailed", reason))
                }
                Err(e) => return WaitOutcome::Rejected(TopologyError::substrate(&entity, e.code, e.message)),
            }
        }
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => WaitOutcome::Cancelled,
        res = time::timeout(policy.timeout, poll) => res.unwrap_or(WaitOutcome::Elapsed),
    };

    match outcome {
        WaitOutcome::Issued => {
            certificate.state = CertificateState::Issued;
            info!(certificate = %entity, "certificate issued");
            Ok(certificate)
        }
        WaitOutcome::Rejected(err) => {
            warn!(certificate = %entity, error = %err, "certificate validation failed");
            Err(err)
        }
        WaitOutcome::Elapsed => {
            cancel.cancel();
            warn!(certificate = %entity, timeout = ?policy.timeout, "certificate wait elapsed, abandoning build");
            Err(TopologyError::timeout(
                entity,
                format!("certificate not issued within {:?}", policy.timeout),
            ))
        }
        WaitOutcome::Cancelled => Err(TopologyError::timeout(
            entity,
            "build abandoned while awaiting certificate issuance",
        )),
    }
}
