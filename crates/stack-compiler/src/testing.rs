//! Shared fixtures for unit tests.

use common::protocol::{NFS_PORT, SSH_PORT};

use crate::access::{chain, AccessChain, Exposure, IngressPort, TierSpec};
use crate::compute::{LogSink, Mount, PortMapping, TaskRequest};
use crate::config::Config;
use crate::network::{allocate, AddressSpace, SubnetSpec};
use crate::storage::{provision, FileMode, PosixOwner, Volume, VolumeSpec};

pub fn space() -> AddressSpace {
    allocate(
        "us-east-1",
        "10.0.0.0/26",
        2,
        &[SubnetSpec::public("public", 28), SubnetSpec::private("private", 28)],
    )
    .unwrap()
}

pub fn access() -> AccessChain {
    chain(&[
        TierSpec::new(
            "edge",
            "load balancer",
            vec![
                IngressPort::tcp(443, "HTTPS").exposed(Exposure::Anywhere),
                IngressPort::tcp(SSH_PORT, "SSH").exposed(Exposure::Anywhere),
            ],
        ),
        TierSpec::new(
            "service",
            "application",
            vec![IngressPort::tcp(6610, "app"), IngressPort::tcp(6611, "ssh")],
        ),
        TierSpec::new("storage", "filesystem", vec![IngressPort::tcp(NFS_PORT, "NFS")]),
    ])
    .unwrap()
}

/// Address space, access chain and a root-owned 755 volume at `/opt/app`.
pub fn storage() -> (AddressSpace, AccessChain, Volume) {
    let space = space();
    let access = access();
    let volume = provision(
        &space,
        access.require("service").unwrap(),
        access.require("storage").unwrap(),
        &VolumeSpec {
            name: "app".into(),
            mount_path: "/opt/app".into(),
            owner: PosixOwner::new(0, 0),
            mode: FileMode::parse("755").unwrap(),
        },
    )
    .unwrap();
    (space, access, volume)
}

pub fn task_request(volume: &Volume, cpu: u32, memory_mib: u32) -> TaskRequest {
    TaskRequest {
        family: "app".into(),
        cpu,
        memory_mib,
        ports: vec![PortMapping::tcp(6610), PortMapping::tcp(6611)],
        mounts: vec![Mount {
            volume: volume.id.clone(),
            container_path: volume.path().to_string(),
            read_only: false,
        }],
        image: "registry.example.com/app:1".into(),
        log_sink: LogSink::awslogs("app"),
    }
}

/// The reference deployment: `10.0.0.0/26`, two zones, `example.com`,
/// 1024/2048, root-owned 755 volume at `/opt/app`. Everything else defaulted.
pub fn config() -> Config {
    serde_json::from_value(serde_json::json!({
        "cidr": "10.0.0.0/26",
        "image": "registry.example.com/app:1",
        "domain_name": "example.com",
        "mount_path": "/opt/app",
        "owner_uid": 0,
        "owner_gid": 0,
        "mode": "755",
        "public_ingress": "anywhere",
        "admin_ingress": "anywhere",
    }))
    .unwrap()
}
