use async_trait::async_trait;
use aws_sdk_acm::types::{CertificateStatus, ValidationMethod};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::provider_error;
use super::route53::upsert_cname;
use crate::naming::{CertificateAuthority, ProviderError, ValidationStatus, Zone};

const VALIDATION_RECORD_TTL: u32 = 300;

/// [`CertificateAuthority`] backed by ACM DNS validation.
///
/// While a certificate is pending, each poll (re)publishes its validation
/// CNAMEs into the zone, so issuance needs no out-of-band step.
#[derive(Clone)]
pub struct AcmAuthority {
    acm: aws_sdk_acm::Client,
    route53: aws_sdk_route53::Client,
}

impl AcmAuthority {
    pub fn new(acm: aws_sdk_acm::Client, route53: aws_sdk_route53::Client) -> Self {
        Self { acm, route53 }
    }
}

#[async_trait]
impl CertificateAuthority for AcmAuthority {
    async fn request(&self, name: &str, _zone: &Zone) -> Result<String, ProviderError> {
        // Same name, same token: a re-run gets the existing request back.
        let token = format!("{:x}", Sha256::digest(name.as_bytes()));

        let resp = self
            .acm
            .request_certificate()
            .domain_name(name)
            .validation_method(ValidationMethod::Dns)
            .idempotency_token(&token[..32])
            .send()
            .await
            .map_err(provider_error)?;

        resp.certificate_arn()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::new("MissingArn", "ACM returned no certificate ARN"))
    }

    async fn validate(&self, certificate: &str, zone: &Zone) -> Result<ValidationStatus, ProviderError> {
        let resp = self
            .acm
            .describe_certificate()
            .certificate_arn(certificate)
            .send()
            .await
            .map_err(provider_error)?;
        let detail = resp
            .certificate()
            .ok_or_else(|| ProviderError::new("MissingCertificate", format!("{certificate} not found")))?;

        match detail.status() {
            Some(CertificateStatus::Issued) => Ok(ValidationStatus::Issued),
            Some(CertificateStatus::PendingValidation) | None => {
                for option in detail.domain_validation_options() {
                    if let Some(record) = option.resource_record() {
                        upsert_cname(
                            &self.route53,
                            &zone.id,
                            record.name(),
                            record.value(),
                            VALIDATION_RECORD_TTL,
                        )
                        .await?;
                    }
                }
                debug!(certificate, "validation pending");
                Ok(ValidationStatus::Pending)
            }
            Some(status) => {
                let reason = detail
                    .failure_reason()
                    .map(|r| r.as_str().to_string())
                    .unwrap_or_else(|| status.as_str().to_string());
                Ok(ValidationStatus::Failed(reason))
            }
        }
    }
}
