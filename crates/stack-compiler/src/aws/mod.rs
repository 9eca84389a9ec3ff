//! AWS-backed DNS provider, certificate authority and load balancer directory.
//!
//! Used by `stackc build` outside of dry runs. SDK failures are reduced to a
//! [`ProviderError`] carrying the service's own error code and message.

pub mod acm;
pub mod clients;
pub mod elb;
pub mod route53;

pub use acm::AcmAuthority;
pub use clients::AwsClients;
pub use elb::ElbDirectory;
pub use route53::Route53Dns;

use aws_sdk_route53::error::{DisplayErrorContext, ProvideErrorMetadata};

use crate::naming::ProviderError;

fn provider_error<E>(err: E) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let code = err.code().unwrap_or("Unknown").to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    ProviderError::new(code, message)
}
