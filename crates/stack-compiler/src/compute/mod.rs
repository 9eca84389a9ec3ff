//! Compute placement: cluster, task definition and the running service.
//!
//! The substrate is consumed only through [`ComputeSubstrate`]. Its rejections
//! are surfaced verbatim and never retried here; retry policy belongs to
//! whoever drives the build.

pub mod fargate;
pub mod substrate;

use common::{Protocol, ResourceId, Result, TopologyError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::access::PermissionGroup;
use crate::network::{AddressSpace, SubnetTier};
use crate::storage::{validate_mount_path, Authorization, Volume};

pub use fargate::FargateSubstrate;
pub use substrate::{
    ClusterHandle, ClusterOptions, ComputeSubstrate, InstanceHandle, Placement, SubstrateError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub id: ResourceId,
    pub name: String,
    pub handle: ClusterHandle,
    pub network: ResourceId,
    pub options: ClusterOptions,
}

/// A port the container listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn tcp(container_port: u16) -> Self {
        Self {
            container_port,
            protocol: Protocol::Tcp,
        }
    }
}

/// A volume mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub volume: ResourceId,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSink {
    pub driver: String,
    pub stream_prefix: String,
}

impl LogSink {
    pub fn awslogs(stream_prefix: impl Into<String>) -> Self {
        Self {
            driver: "awslogs".to_string(),
            stream_prefix: stream_prefix.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimePlatform {
    pub operating_system: String,
    pub cpu_architecture: String,
}

impl Default for RuntimePlatform {
    fn default() -> Self {
        Self {
            operating_system: "LINUX".to_string(),
            cpu_architecture: "X86_64".to_string(),
        }
    }
}

/// Caller's request for a task definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub family: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<Mount>,
    pub image: String,
    pub log_sink: LogSink,
}

/// How the task reaches one provisioned volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskVolume {
    pub volume: ResourceId,
    pub filesystem: ResourceId,
    pub access_point: ResourceId,
    pub transit_encryption: bool,
    pub authorization: Authorization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSpec {
    pub id: ResourceId,
    pub family: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<Mount>,
    pub volumes: Vec<TaskVolume>,
    pub log_sink: LogSink,
    pub runtime_platform: RuntimePlatform,
    /// SHA-256 over every other field.
    pub revision: String,
}

impl TaskSpec {
    pub fn port_numbers(&self) -> Vec<u16> {
        self.ports.iter().map(|p| p.container_port).collect()
    }
}

/// A placed, running service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInstance {
    pub id: ResourceId,
    pub handle: InstanceHandle,
    pub cluster: ResourceId,
    pub task: ResourceId,
    pub task_revision: String,
    pub ports: Vec<u16>,
    pub tier: SubnetTier,
    pub subnets: Vec<ResourceId>,
    pub security_group: ResourceId,
    pub assign_public_ip: bool,
    pub desired_count: u32,
}

impl ServiceInstance {
    /// A changed task revision means the instance is rebuilt, never edited.
    pub fn needs_replacement(&self, task: &TaskSpec) -> bool {
        self.task != task.id || self.task_revision != task.revision
    }
}

/// Register a cluster bound to `space`.
pub async fn create_cluster(
    substrate: &dyn ComputeSubstrate,
    name: &str,
    space: &AddressSpace,
) -> Result<Cluster> {
    let id = ResourceId::new(format!("cluster-{name}"));
    if name.is_empty()
        || name.len() > 255
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TopologyError::validation(
            id.as_str(),
            format!("cluster name {name:?} must be 1-255 letters, digits, '-' or '_'"),
        ));
    }

    let options = ClusterOptions::default();
    let handle = substrate
        .create_cluster(name, &options)
        .await
        .map_err(|e| TopologyError::substrate(id.as_str(), e.code, e.message))?;

    info!(cluster = %id, handle = %handle.0, "cluster created");
    Ok(Cluster {
        id,
        name: name.to_string(),
        handle,
        network: space.id.clone(),
        options,
    })
}

/// Define a task against already-provisioned `volumes`.
///
/// # Errors
///
/// - [`TopologyError::Validation`] for no ports, duplicate or zero ports, no
///   mounts, an empty image, a mount naming an unknown volume, or a cpu/memory
///   pair the substrate rejects (its message is carried unchanged).
/// - [`TopologyError::Config`] when a mount path differs from the access point
///   path, or a read-write mount goes through an access point that cannot write.
pub fn define_task(
    substrate: &dyn ComputeSubstrate,
    request: TaskRequest,
    volumes: &[Volume],
) -> Result<TaskSpec> {
    let id = ResourceId::new(format!("task-{}", request.family));
    let entity = id.as_str();

    if request.family.trim().is_empty() {
        return Err(TopologyError::validation("task", "task family must not be empty"));
    }
    if request.ports.is_empty() {
        return Err(TopologyError::validation(entity, "task must declare at least one port"));
    }
    let mut seen = std::collections::HashSet::new();
    for port in &request.ports {
        if port.container_port == 0 {
            return Err(TopologyError::validation(entity, "container port 0 is not valid"));
        }
        if !seen.insert(port.container_port) {
            return Err(TopologyError::validation(
                entity,
                format!("container port {} declared twice", port.container_port),
            ));
        }
    }
    if request.image.trim().is_empty() {
        return Err(TopologyError::validation(entity, "image reference must not be empty"));
    }
    if request.mounts.is_empty() {
        return Err(TopologyError::validation(entity, "task must mount at least one volume"));
    }

    substrate
        .validate_sizing(request.cpu, request.memory_mib)
        .map_err(|e| TopologyError::validation(entity, e.to_string()))?;

    let mut task_volumes = Vec::with_capacity(request.mounts.len());
    for mount in &request.mounts {
        let volume = volumes.iter().find(|v| v.id == mount.volume).ok_or_else(|| {
            TopologyError::validation(entity, format!("mount references unknown volume {}", mount.volume))
        })?;
        validate_mount_path(entity, &mount.container_path)?;

        if mount.container_path != volume.path() {
            return Err(TopologyError::config(
                entity,
                format!(
                    "mount path {} does not match access point {} path {}",
                    mount.container_path,
                    volume.access_point.id,
                    volume.path()
                ),
            ));
        }
        if !mount.read_only && !volume.access_point.grants_write() {
            return Err(TopologyError::config(
                entity,
                format!(
                    "read-write mount of {} but access point {} (owner {}, mode {}) denies write to {}",
                    volume.id,
                    volume.access_point.id,
                    volume.owner(),
                    volume.mode(),
                    volume.access_point.posix_user
                ),
            ));
        }

        if !task_volumes.iter().any(|v: &TaskVolume| v.volume == volume.id) {
            task_volumes.push(TaskVolume {
                volume: volume.id.clone(),
                filesystem: volume.filesystem.id.clone(),
                access_point: volume.access_point.id.clone(),
                transit_encryption: volume.transit_encryption,
                authorization: volume.authorization,
            });
        }
    }

    let mut spec = TaskSpec {
        id,
        family: request.family,
        cpu: request.cpu,
        memory_mib: request.memory_mib,
        image: request.image,
        ports: request.ports,
        mounts: request.mounts,
        volumes: task_volumes,
        log_sink: request.log_sink,
        runtime_platform: RuntimePlatform::default(),
        revision: String::new(),
    };
    spec.revision = revision(&spec)?;

    debug!(task = %spec.id, revision = %spec.revision, "task defined");
    Ok(spec)
}

/// Schedule `task` into the private tier behind `group`.
///
/// # Errors
///
/// - [`TopologyError::Config`] for the public tier, an edge group, a space
///   without private subnets, or a task port `group` does not open.
/// - [`TopologyError::Substrate`] when the substrate refuses to schedule.
pub async fn place(
    substrate: &dyn ComputeSubstrate,
    cluster: &Cluster,
    task: &TaskSpec,
    tier: SubnetTier,
    space: &AddressSpace,
    group: &PermissionGroup,
) -> Result<ServiceInstance> {
    let id = ResourceId::new(format!("service-{}", task.family));
    let entity = id.as_str();

    if tier == SubnetTier::Public {
        return Err(TopologyError::config(
            entity,
            "compute is never placed in the public tier",
        ));
    }
    if group.is_edge() {
        return Err(TopologyError::config(
            entity,
            format!("{} is internet-facing; services sit behind the edge tier", group.id),
        ));
    }
    let open = group.open_ports();
    if let Some(port) = task.ports.iter().find(|p| !open.contains(&p.container_port)) {
        return Err(TopologyError::config(
            entity,
            format!("container port {} has no rule in {}", port.container_port, group.id),
        ));
    }
    let subnets = space.subnet_ids(tier);
    if subnets.is_empty() {
        return Err(TopologyError::config(entity, format!("address space has no {tier} subnets")));
    }

    let placement = Placement {
        cluster: cluster.handle.clone(),
        subnets: subnets.clone(),
        security_group: group.id.clone(),
        assign_public_ip: false,
    };
    let handle = substrate
        .schedule(task, &placement)
        .await
        .map_err(|e| TopologyError::substrate(entity, e.code, e.message))?;

    info!(service = %id, handle = %handle.0, revision = %task.revision, "service placed");
    Ok(ServiceInstance {
        id,
        handle,
        cluster: cluster.id.clone(),
        task: task.id.clone(),
        task_revision: task.revision.clone(),
        ports: task.port_numbers(),
        tier,
        subnets,
        security_group: group.id.clone(),
        assign_public_ip: false,
        desired_count: 1,
    })
}

fn revision(spec: &TaskSpec) -> Result<String> {
    #[derive(Serialize)]
    struct Body<'a> {
        family: &'a str,
        cpu: u32,
        memory_mib: u32,
        image: &'a str,
        ports: &'a [PortMapping],
        mounts: &'a [Mount],
        volumes: &'a [TaskVolume],
        log_sink: &'a LogSink,
        runtime_platform: &'a RuntimePlatform,
    }

    let body = serde_json::to_vec(&Body {
        family: &spec.family,
        cpu: spec.cpu,
        memory_mib: spec.memory_mib,
        image: &spec.image,
        ports: &spec.ports,
        mounts: &spec.mounts,
        volumes: &spec.volumes,
        log_sink: &spec.log_sink,
        runtime_platform: &spec.runtime_platform,
    })
    .map_err(|e| TopologyError::validation(spec.id.as_str(), format!("unserializable task: {e}")))?;

    Ok(format!("{:x}", Sha256::digest(&body)))
}

#[cfg(test)]
mod tests {
    use super::substrate::MockComputeSubstrate;
    use super::*;
    use crate::storage::{FileMode, PosixOwner};
    use crate::testing;

    fn request(volume: &Volume) -> TaskRequest {
        testing::task_request(volume, 1024, 2048)
    }

    #[test]
    fn defines_task_with_revision() {
        let (_, _, volume) = testing::storage();
        let fargate = FargateSubstrate::new();
        let task = define_task(&fargate, request(&volume), &[volume.clone()]).unwrap();
        assert_eq!(task.port_numbers(), vec![6610, 6611]);
        assert_eq!(task.volumes.len(), 1);
        assert_eq!(task.volumes[0].access_point, volume.access_point.id);
        assert_eq!(task.revision.len(), 64);

        let again = define_task(&fargate, request(&volume), &[volume.clone()]).unwrap();
        assert_eq!(task.revision, again.revision);

        let mut bumped = request(&volume);
        bumped.image = "registry.example.com/app:2".into();
        let changed = define_task(&fargate, bumped, &[volume]).unwrap();
        assert_ne!(task.revision, changed.revision);
    }

    #[test]
    fn request_shape_errors_are_validation() {
        let (_, _, volume) = testing::storage();
        let fargate = FargateSubstrate::new();

        let mut no_ports = request(&volume);
        no_ports.ports.clear();
        let mut no_image = request(&volume);
        no_image.image = " ".into();
        let mut unknown = request(&volume);
        unknown.mounts[0].volume = "volume-missing".into();
        let mut dup = request(&volume);
        dup.ports.push(PortMapping::tcp(6610));

        for bad in [no_ports, no_image, unknown, dup] {
            let err = define_task(&fargate, bad, &[volume.clone()]).unwrap_err();
            assert!(matches!(err, TopologyError::Validation { .. }), "{err}");
            assert_eq!(err.entity(), "task-app");
        }
    }

    #[test]
    fn sizing_rejection_is_surfaced_verbatim() {
        let (_, _, volume) = testing::storage();
        let mut mock = MockComputeSubstrate::new();
        mock.expect_validate_sizing()
            .returning(|_, _| Err(SubstrateError::new("ClientException", "odd sizing 1024/1000")));

        let mut req = request(&volume);
        req.memory_mib = 1000;
        let err = define_task(&mock, req, &[volume]).unwrap_err();
        match err {
            TopologyError::Validation { reason, .. } => {
                assert!(reason.contains("odd sizing 1024/1000"));
                assert!(reason.contains("ClientException"));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn mount_must_match_access_point() {
        let (_, _, volume) = testing::storage();
        let mut req = request(&volume);
        req.mounts[0].container_path = "/srv/data".into();
        let err = define_task(&FargateSubstrate::new(), req, &[volume]).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
    }

    #[test]
    fn read_write_mount_needs_write_access() {
        let (_, _, mut volume) = testing::storage();
        volume.access_point.owner = PosixOwner::new(1000, 1000);
        volume.access_point.posix_user = PosixOwner::new(1000, 1000);
        volume.access_point.mode = FileMode::parse("555").unwrap();

        let err = define_task(&FargateSubstrate::new(), request(&volume), &[volume.clone()]).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }), "{err}");

        let mut read_only = request(&volume);
        read_only.mounts[0].read_only = true;
        assert!(define_task(&FargateSubstrate::new(), read_only, &[volume]).is_ok());
    }

    #[tokio::test]
    async fn places_in_private_tier() {
        let (space, chain, volume) = testing::storage();
        let fargate = FargateSubstrate::new();
        let cluster = create_cluster(&fargate, "app-cluster", &space).await.unwrap();
        let task = define_task(&fargate, request(&volume), &[volume]).unwrap();
        let service = chain.require("service").unwrap();

        let instance = place(&fargate, &cluster, &task, SubnetTier::Private, &space, service)
            .await
            .unwrap();
        assert_eq!(instance.tier, SubnetTier::Private);
        assert_eq!(instance.subnets, space.subnet_ids(SubnetTier::Private));
        assert!(!instance.assign_public_ip);
        assert!(instance.handle.0.starts_with("fargate://cluster/app-cluster/service/"));
        assert!(!instance.needs_replacement(&task));

        let mut changed = task.clone();
        changed.revision = "0".repeat(64);
        assert!(instance.needs_replacement(&changed));
    }

    #[tokio::test]
    async fn public_tier_and_unopened_ports_are_config_errors() {
        let (space, chain, volume) = testing::storage();
        let fargate = FargateSubstrate::new();
        let cluster = create_cluster(&fargate, "app-cluster", &space).await.unwrap();
        let task = define_task(&fargate, request(&volume), &[volume]).unwrap();
        let service = chain.require("service").unwrap();

        let err = place(&fargate, &cluster, &task, SubnetTier::Public, &space, service)
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));

        // storage tier only opens NFS
        let storage = chain.require("storage").unwrap();
        let err = place(&fargate, &cluster, &task, SubnetTier::Private, &space, storage)
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
        assert!(err.to_string().contains("6610"));

        let err = place(&fargate, &cluster, &task, SubnetTier::Private, &space, chain.edge())
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
    }

    #[tokio::test]
    async fn schedule_failure_is_not_retried() {
        let (space, chain, volume) = testing::storage();
        let fargate = FargateSubstrate::new();
        let cluster = create_cluster(&fargate, "app-cluster", &space).await.unwrap();
        let task = define_task(&fargate, request(&volume), &[volume]).unwrap();

        let mut mock = MockComputeSubstrate::new();
        mock.expect_schedule()
            .times(1)
            .returning(|_, _| Err(SubstrateError::new("LimitExceeded", "quota reached")));

        let err = place(&mock, &cluster, &task, SubnetTier::Private, &space, chain.require("service").unwrap())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TopologyError::substrate("service-app", "LimitExceeded", "quota reached")
        );
    }

    #[tokio::test]
    async fn capacity_limit_surfaces_as_substrate_error() {
        let (space, chain, volume) = testing::storage();
        let fargate = FargateSubstrate::with_task_limit(0);
        let cluster = create_cluster(&fargate, "app-cluster", &space).await.unwrap();
        let task = define_task(&fargate, request(&volume), &[volume]).unwrap();
        let err = place(&fargate, &cluster, &task, SubnetTier::Private, &space, chain.require("service").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::Substrate { ref code, .. } if code == "CapacityUnavailable"));
    }

    #[tokio::test]
    async fn cluster_name_is_validated() {
        let (space, _, _) = testing::storage();
        let err = create_cluster(&FargateSubstrate::new(), "bad name", &space).await.unwrap_err();
        assert!(matches!(err, TopologyError::Validation { .. }));
    }
}
