//! Configuration loading and validation for a deployment.
//!
//! Values come from an optional YAML/JSON file, overridden by `STACK_*`
//! environment variables (e.g. `STACK_CIDR`, `STACK_OWNER_UID`). Ownership,
//! mode and both edge exposures have no default and must be stated.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use common::protocol::NFS_PORT;
use common::TopologyError;
use serde::{Deserialize, Serialize};

use crate::access::{Exposure, IngressPort, TierSpec, EDGE_TIER, SERVICE_TIER, STORAGE_TIER};
use crate::compute::{LogSink, Mount, PortMapping, TaskRequest};
use crate::naming::{qualify, validate_hostname, WaitPolicy};
use crate::network::{
    parse_block, SubnetSpec, MAX_AZ_COUNT, MAX_SUBNET_MASK, MIN_AZ_COUNT, MIN_SUBNET_MASK,
};
use crate::storage::{validate_mount_path, FileMode, PosixOwner, Volume, VolumeSpec};

/// Name shared by the volume, task family and service.
pub const APP_NAME: &str = "app";

/// Validated deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Region for the address space and the certificate.
    #[serde(default = "default_region")]
    pub region: String,

    /// Address block, e.g. `10.0.0.0/26`. **Required.**
    pub cidr: String,

    #[serde(default = "default_az_count")]
    pub az_count: u8,

    /// Mask of every subnet.
    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: u8,

    /// Container image, `registry/name:tag`. **Required.**
    pub image: String,

    /// Apex domain of the hosted zone. **Required.**
    pub domain_name: String,

    /// Record name under `domain_name` pointing at the load balancer.
    #[serde(default = "default_record_name")]
    pub record_name: String,

    #[serde(default = "default_dns_ttl")]
    pub dns_ttl_secs: u32,

    #[serde(default = "default_cpu")]
    pub cpu: u32,

    #[serde(default = "default_memory")]
    pub memory_mib: u32,

    /// Absolute path of the access point, mounted at the same path in the
    /// container. **Required.**
    pub mount_path: String,

    /// **Required.**
    pub owner_uid: u32,

    /// **Required.**
    pub owner_gid: u32,

    /// Octal permission bits of the access point root, e.g. `"755"`. **Required.**
    pub mode: String,

    /// Who may reach the TLS port: `anywhere` or comma-separated CIDRs. **Required.**
    pub public_ingress: String,

    /// Who may reach the admin (SSH) port: `anywhere` or comma-separated CIDRs.
    /// **Required.**
    pub admin_ingress: String,

    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    /// Container port behind the TLS listener.
    #[serde(default = "default_app_port")]
    pub app_port: u16,

    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Container port behind the admin listener.
    #[serde(default = "default_admin_target_port")]
    pub admin_target_port: u16,

    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Existing network load balancer whose DNS name the record targets.
    #[serde(default = "default_load_balancer_name")]
    pub load_balancer_name: String,

    #[serde(default = "default_log_stream_prefix")]
    pub log_stream_prefix: String,

    /// Upper bound on the certificate wait.
    #[serde(default = "default_cert_timeout")]
    pub cert_timeout_secs: u64,

    #[serde(default = "default_cert_poll_interval")]
    pub cert_poll_interval_secs: u64,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Applied to every resource once the build completes.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_region() -> String {
    "us-east-1".into()
}
fn default_az_count() -> u8 {
    2
}
fn default_subnet_mask() -> u8 {
    28
}
fn default_record_name() -> String {
    "app".into()
}
fn default_dns_ttl() -> u32 {
    60
}
fn default_cpu() -> u32 {
    1024
}
fn default_memory() -> u32 {
    2048
}
fn default_tls_port() -> u16 {
    443
}
fn default_app_port() -> u16 {
    6610
}
fn default_admin_port() -> u16 {
    22
}
fn default_admin_target_port() -> u16 {
    6611
}
fn default_cluster_name() -> String {
    "app-cluster".into()
}
fn default_load_balancer_name() -> String {
    "edge-nlb".into()
}
fn default_log_stream_prefix() -> String {
    "app".into()
}
fn default_cert_timeout() -> u64 {
    900
}
fn default_cert_poll_interval() -> u64 {
    15
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load from `path` (if any) and the environment, then validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a required value is absent
    /// or unparsable, or [`Config::validate`] fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg = builder
            .add_source(
                config::Environment::with_prefix("STACK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to build configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Statically check every field, returning the first failure.
    ///
    /// Nothing here touches an external collaborator.
    pub fn validate(&self) -> common::Result<()> {
        parse_block(&self.cidr)?;
        if self.az_count < MIN_AZ_COUNT {
            return Err(TopologyError::config(
                "az_count",
                format!("must be at least {MIN_AZ_COUNT}"),
            ));
        }
        if self.az_count > MAX_AZ_COUNT {
            return Err(TopologyError::config(
                "az_count",
                format!("must be at most {MAX_AZ_COUNT}"),
            ));
        }
        if !(MIN_SUBNET_MASK..=MAX_SUBNET_MASK).contains(&self.subnet_mask) {
            return Err(TopologyError::validation(
                "subnet_mask",
                format!("must be within /{MIN_SUBNET_MASK}../{MAX_SUBNET_MASK}"),
            ));
        }
        if self.image.trim().is_empty() {
            return Err(TopologyError::validation("image", "is required and must not be empty"));
        }
        validate_hostname("domain_name", &self.domain_name)?;
        validate_hostname("record_name", &self.fqdn())?;
        if self.dns_ttl_secs == 0 {
            return Err(TopologyError::validation("dns_ttl_secs", "must be > 0"));
        }
        if self.cpu == 0 || self.memory_mib == 0 {
            return Err(TopologyError::validation("cpu/memory_mib", "must be > 0"));
        }
        validate_mount_path("mount_path", &self.mount_path)?;
        FileMode::parse(&self.mode)?;
        self.tiers()?;

        for (name, port) in [
            ("tls_port", self.tls_port),
            ("app_port", self.app_port),
            ("admin_port", self.admin_port),
            ("admin_target_port", self.admin_target_port),
        ] {
            if port == 0 {
                return Err(TopologyError::validation(name, "port must be > 0"));
            }
        }
        if self.tls_port == self.admin_port {
            return Err(TopologyError::config(
                "admin_port",
                "listeners need distinct external ports",
            ));
        }
        if self.app_port == self.admin_target_port {
            return Err(TopologyError::config(
                "admin_target_port",
                "listeners need distinct target ports",
            ));
        }
        if self.cluster_name.trim().is_empty() {
            return Err(TopologyError::validation("cluster_name", "must not be empty"));
        }
        if self.load_balancer_name.trim().is_empty() {
            return Err(TopologyError::validation("load_balancer_name", "must not be empty"));
        }
        if self.cert_timeout_secs == 0 || self.cert_poll_interval_secs == 0 {
            return Err(TopologyError::validation(
                "cert_timeout_secs",
                "timeout and poll interval must be > 0",
            ));
        }
        if self.cert_poll_interval_secs > self.cert_timeout_secs {
            return Err(TopologyError::validation(
                "cert_poll_interval_secs",
                "must not exceed cert_timeout_secs",
            ));
        }
        Ok(())
    }

    /// Fully-qualified name of the DNS record and the certificate.
    pub fn fqdn(&self) -> String {
        qualify(&self.record_name, &self.domain_name)
    }

    pub fn subnet_specs(&self) -> Vec<SubnetSpec> {
        vec![
            SubnetSpec::public("public", self.subnet_mask),
            SubnetSpec::private("private", self.subnet_mask),
        ]
    }

    /// The edge → service → storage chain for the configured ports.
    pub fn tiers(&self) -> common::Result<Vec<TierSpec>> {
        let edge_id = format!("sg-{EDGE_TIER}");
        let public = Exposure::parse(&edge_id, &self.public_ingress)?;
        let admin = Exposure::parse(&edge_id, &self.admin_ingress)?;

        Ok(vec![
            TierSpec::new(
                EDGE_TIER,
                "internet-facing load balancer",
                vec![
                    IngressPort::tcp(self.tls_port, "HTTPS").exposed(public),
                    IngressPort::tcp(self.admin_port, "SSH").exposed(admin),
                ],
            ),
            TierSpec::new(
                SERVICE_TIER,
                "application service",
                vec![
                    IngressPort::tcp(self.app_port, "application traffic from the load balancer"),
                    IngressPort::tcp(self.admin_target_port, "SSH from the load balancer"),
                ],
            ),
            TierSpec::new(
                STORAGE_TIER,
                "shared filesystem",
                vec![IngressPort::tcp(NFS_PORT, "NFS from the application service")],
            ),
        ])
    }

    pub fn volume_spec(&self) -> common::Result<VolumeSpec> {
        Ok(VolumeSpec {
            name: APP_NAME.to_string(),
            mount_path: self.mount_path.clone(),
            owner: PosixOwner::new(self.owner_uid, self.owner_gid),
            mode: FileMode::parse(&self.mode)?,
        })
    }

    /// A task mounting `volume` read-write at its access point path.
    pub fn task_request(&self, volume: &Volume) -> TaskRequest {
        TaskRequest {
            family: APP_NAME.to_string(),
            cpu: self.cpu,
            memory_mib: self.memory_mib,
            ports: vec![
                PortMapping::tcp(self.app_port),
                PortMapping::tcp(self.admin_target_port),
            ],
            mounts: vec![Mount {
                volume: volume.id.clone(),
                container_path: volume.path().to_string(),
                read_only: false,
            }],
            image: self.image.clone(),
            log_sink: LogSink::awslogs(&self.log_stream_prefix),
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::new(
            Duration::from_secs(self.cert_timeout_secs),
            Duration::from_secs(self.cert_poll_interval_secs),
        )
    }
}
