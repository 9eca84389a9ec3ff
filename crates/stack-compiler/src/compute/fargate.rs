//! [`FargateSubstrate`]: in-process serverless substrate.
//!
//! Enforces the serverless CPU/memory table and hands out cluster and service
//! handles. An optional task limit models account capacity.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::substrate::{
    ClusterHandle, ClusterOptions, ComputeSubstrate, InstanceHandle, Placement, SubstrateError,
};
use super::TaskSpec;

/// Whether `memory_mib` is an allowed pairing for `cpu` units.
pub fn is_valid_sizing(cpu: u32, memory_mib: u32) -> bool {
    let stepped = |min: u32, max: u32, step: u32| {
        (min..=max).contains(&memory_mib) && memory_mib % step == 0
    };
    match cpu {
        256 => matches!(memory_mib, 512 | 1024 | 2048),
        512 => stepped(1024, 4096, 1024),
        1024 => stepped(2048, 8192, 1024),
        2048 => stepped(4096, 16384, 1024),
        4096 => stepped(8192, 30720, 1024),
        8192 => stepped(16384, 61440, 4096),
        16384 => stepped(32768, 122880, 8192),
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct FargateSubstrate {
    task_limit: Option<usize>,
    scheduled: AtomicUsize,
}

impl FargateSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A substrate that rejects scheduling once `limit` services are running.
    pub fn with_task_limit(limit: usize) -> Self {
        Self {
            task_limit: Some(limit),
            scheduled: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ComputeSubstrate for FargateSubstrate {
    fn validate_sizing(&self, cpu: u32, memory_mib: u32) -> Result<(), SubstrateError> {
        if is_valid_sizing(cpu, memory_mib) {
            Ok(())
        } else {
            Err(SubstrateError::new(
                "ClientException",
                format!("No Fargate configuration exists for given values: {cpu} CPU, {memory_mib} memory."),
            ))
        }
    }

    async fn create_cluster(
        &self,
        name: &str,
        options: &ClusterOptions,
    ) -> Result<ClusterHandle, SubstrateError> {
        debug!(cluster = name, insights = options.container_insights, "creating cluster");
        Ok(ClusterHandle(format!("fargate://cluster/{name}")))
    }

    async fn schedule(
        &self,
        task: &TaskSpec,
        placement: &Placement,
    ) -> Result<InstanceHandle, SubstrateError> {
        self.validate_sizing(task.cpu, task.memory_mib)?;

        let running = self.scheduled.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.task_limit {
            if running >= limit {
                self.scheduled.fetch_sub(1, Ordering::SeqCst);
                return Err(SubstrateError::new(
                    "CapacityUnavailable",
                    format!("task limit of {limit} reached in {}", placement.cluster.0),
                ));
            }
        }

        let handle = InstanceHandle(format!(
            "{}/service/{}",
            placement.cluster.0,
            uuid::Uuid::new_v4()
        ));
        debug!(service = %handle.0, family = %task.family, "service scheduled");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_table() {
        assert!(is_valid_sizing(1024, 2048));
        assert!(is_valid_sizing(256, 512));
        assert!(is_valid_sizing(16384, 122880));
        assert!(!is_valid_sizing(1024, 1024));
        assert!(!is_valid_sizing(1000, 2048));
        assert!(!is_valid_sizing(256, 4096));
        assert!(!is_valid_sizing(8192, 17408));
    }

    #[test]
    fn rejection_carries_code_and_message() {
        let err = FargateSubstrate::new().validate_sizing(1024, 1024).unwrap_err();
        assert_eq!(err.code, "ClientException");
        assert!(err.message.contains("1024 CPU, 1024 memory"));
    }

    #[tokio::test]
    async fn cluster_handle_names_cluster() {
        let handle = FargateSubstrate::new()
            .create_cluster("app-cluster", &ClusterOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.0, "fargate://cluster/app-cluster");
    }
}
