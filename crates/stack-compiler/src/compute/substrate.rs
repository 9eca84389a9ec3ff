//! The serverless compute substrate, consumed as an external collaborator.
//!
//! Errors are opaque [`SubstrateError`]s carrying the substrate's own code and
//! message. Callers surface them verbatim and never retry.

use async_trait::async_trait;
use common::ResourceId;
use serde::Serialize;
use thiserror::Error;

use super::TaskSpec;

/// A request rejected by the substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct SubstrateError {
    pub code: String,
    pub message: String,
}

impl SubstrateError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterOptions {
    pub container_insights: bool,
    pub serverless_capacity_providers: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            container_insights: true,
            serverless_capacity_providers: true,
        }
    }
}

/// Substrate-assigned cluster handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ClusterHandle(pub String);

/// Substrate-assigned handle of a running service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct InstanceHandle(pub String);

/// Where a task is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub cluster: ClusterHandle,
    pub subnets: Vec<ResourceId>,
    pub security_group: ResourceId,
    pub assign_public_ip: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComputeSubstrate: Send + Sync {
    /// Check a cpu/memory reservation against the substrate's allowed combinations.
    fn validate_sizing(&self, cpu: u32, memory_mib: u32) -> Result<(), SubstrateError>;

    async fn create_cluster(
        &self,
        name: &str,
        options: &ClusterOptions,
    ) -> Result<ClusterHandle, SubstrateError>;

    async fn schedule(
        &self,
        task: &TaskSpec,
        placement: &Placement,
    ) -> Result<InstanceHandle, SubstrateError>;
}
