//! Shared storage: a network filesystem plus one permission-bound access point.
//!
//! # Invariants
//!
//! - Owner and mode of the access point are always supplied by the caller. There
//!   is no default, because a silent non-root default breaks containers that write
//!   as a different uid.
//! - The filesystem is reachable only through the storage tier, which must admit
//!   the client (service) tier on the NFS port.
//! - Encryption in transit and IAM authorization are always on.

use std::fmt;
use std::path::Path;

use common::protocol::NFS_PORT;
use common::{ResourceId, Result, TopologyError};
use serde::{Deserialize, Serialize, Serializer};

use crate::access::PermissionGroup;
use crate::network::{AddressSpace, SubnetTier};

/// POSIX owner of the access point root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixOwner {
    pub uid: u32,
    pub gid: u32,
}

impl PosixOwner {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

impl fmt::Display for PosixOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Permission bits of the access point root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(u16);

impl FileMode {
    /// Largest representable mode (setuid/setgid/sticky + rwxrwxrwx).
    pub const MAX: u16 = 0o7777;

    /// Parse octal text such as `"755"` or `"0750"`.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Validation`] for non-octal text or a value above `7777`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let bits = u16::from_str_radix(text, 8)
            .map_err(|_| TopologyError::validation("access-point", format!("mode {text:?} is not octal")))?;
        Self::from_bits(bits)
    }

    pub fn from_bits(bits: u16) -> Result<Self> {
        if bits > Self::MAX {
            return Err(TopologyError::validation(
                "access-point",
                format!("mode {bits:o} exceeds {:o}", Self::MAX),
            ));
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

impl Serialize for FileMode {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// How clients authenticate to the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Authorization {
    Iam,
}

/// Caller's request for a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub mount_path: String,
    pub owner: PosixOwner,
    pub mode: FileMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct Filesystem {
    pub id: ResourceId,
    pub security_group: ResourceId,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MountTarget {
    pub id: ResourceId,
    pub subnet: ResourceId,
    pub security_group: ResourceId,
}

/// Scoped entry into the filesystem. The root directory is created with
/// `owner`/`mode` and every client is mapped to `posix_user`.
#[derive(Debug, Clone, Serialize)]
pub struct AccessPoint {
    pub id: ResourceId,
    pub path: String,
    pub owner: PosixOwner,
    pub mode: FileMode,
    pub posix_user: PosixOwner,
}

impl AccessPoint {
    /// Whether clients can write the access point root. Every NFS operation runs
    /// as `posix_user`, whatever uid the container process itself has.
    pub fn grants_write(&self) -> bool {
        let bits = self.mode.bits();
        let user = self.posix_user;
        user.uid == 0
            || (user.uid == self.owner.uid && bits & 0o200 != 0)
            || (user.gid == self.owner.gid && bits & 0o020 != 0)
            || bits & 0o002 != 0
    }
}

/// A provisioned shared volume.
#[derive(Debug, Clone, Serialize)]
pub struct Volume {
    pub id: ResourceId,
    pub name: String,
    pub filesystem: Filesystem,
    pub access_point: AccessPoint,
    pub mount_targets: Vec<MountTarget>,
    pub transit_encryption: bool,
    pub authorization: Authorization,
}

impl Volume {
    pub fn owner(&self) -> PosixOwner {
        self.access_point.owner
    }

    pub fn mode(&self) -> FileMode {
        self.access_point.mode
    }

    pub fn path(&self) -> &str {
        &self.access_point.path
    }
}

/// Provision the filesystem, one mount target per private subnet, and the access point.
///
/// # Errors
///
/// - [`TopologyError::Validation`] for an empty or non-absolute `mount_path`, or a
///   path containing `.`/`..` segments.
/// - [`TopologyError::Config`] when `storage_group` does not admit `client_group`
///   on the NFS port, is internet-facing, or the space has no private tier.
pub fn provision(
    space: &AddressSpace,
    client_group: &PermissionGroup,
    storage_group: &PermissionGroup,
    spec: &VolumeSpec,
) -> Result<Volume> {
    let id = ResourceId::new(format!("volume-{}", spec.name));
    validate_mount_path(id.as_str(), &spec.mount_path)?;

    if storage_group.is_edge() {
        return Err(TopologyError::config(
            storage_group.id.as_str(),
            "storage group must not be an internet-facing edge group",
        ));
    }
    if !storage_group.admits_group(&client_group.id, NFS_PORT) {
        return Err(TopologyError::config(
            storage_group.id.as_str(),
            format!(
                "storage tier does not admit {} on NFS port {NFS_PORT}",
                client_group.id
            ),
        ));
    }
    if !space.has_tier(SubnetTier::Private) {
        return Err(TopologyError::config(
            id.as_str(),
            "mount targets require a private tier",
        ));
    }

    let filesystem = Filesystem {
        id: ResourceId::new(format!("fs-{}", spec.name)),
        security_group: storage_group.id.clone(),
        encrypted: true,
    };
    let mount_targets = space
        .subnets_in(SubnetTier::Private)
        .enumerate()
        .map(|(i, subnet)| MountTarget {
            id: ResourceId::new(format!("fsmt-{}-{}", spec.name, i + 1)),
            subnet: subnet.id.clone(),
            security_group: storage_group.id.clone(),
        })
        .collect();
    let access_point = AccessPoint {
        id: ResourceId::new(format!("fsap-{}", spec.name)),
        path: spec.mount_path.clone(),
        owner: spec.owner,
        mode: spec.mode,
        posix_user: spec.owner,
    };

    tracing::debug!(
        volume = %id,
        path = %access_point.path,
        owner = %access_point.owner,
        mode = %access_point.mode,
        "volume provisioned"
    );

    Ok(Volume {
        id,
        name: spec.name.clone(),
        filesystem,
        access_point,
        mount_targets,
        transit_encryption: true,
        authorization: Authorization::Iam,
    })
}

/// Reject empty, relative, or non-normalized mount paths.
pub fn validate_mount_path(entity: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(TopologyError::validation(entity, "mount path must not be empty"));
    }
    if !Path::new(path).is_absolute() {
        return Err(TopologyError::validation(
            entity,
            format!("mount path {path:?} must be absolute"),
        ));
    }
    if path.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(TopologyError::validation(
            entity,
            format!("mount path {path:?} must not contain '.' or '..'"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{chain, AccessChain, Exposure, IngressPort, TierSpec};
    use crate::network::{allocate, SubnetSpec};

    fn fixture() -> (AddressSpace, AccessChain) {
        let space = allocate(
            "us-east-1",
            "10.0.0.0/26",
            2,
            &[SubnetSpec::public("public", 28), SubnetSpec::private("private", 28)],
        )
        .unwrap();
        let chain = chain(&[
            TierSpec::new("edge", "lb", vec![IngressPort::tcp(443, "HTTPS").exposed(Exposure::Anywhere)]),
            TierSpec::new("service", "app", vec![IngressPort::tcp(6610, "app")]),
            TierSpec::new("storage", "fs", vec![IngressPort::tcp(NFS_PORT, "NFS")]),
        ])
        .unwrap();
        (space, chain)
    }

    fn spec(path: &str, owner: PosixOwner, mode: &str) -> VolumeSpec {
        VolumeSpec {
            name: "data".into(),
            mount_path: path.into(),
            owner,
            mode: FileMode::parse(mode).unwrap(),
        }
    }

    #[test]
    fn owner_and_mode_read_back_exactly() {
        let (space, chain) = fixture();
        let service = chain.require("service").unwrap();
        let storage = chain.require("storage").unwrap();
        for (owner, mode) in [(PosixOwner::new(0, 0), "755"), (PosixOwner::new(1000, 1001), "0750")] {
            let volume = provision(&space, service, storage, &spec("/opt/app", owner, mode)).unwrap();
            assert_eq!(volume.owner(), owner);
            assert_eq!(volume.mode(), FileMode::parse(mode).unwrap());
            assert_eq!(volume.access_point.posix_user, owner);
            assert_eq!(volume.path(), "/opt/app");
        }
    }

    #[test]
    fn mount_targets_cover_private_subnets_only() {
        let (space, chain) = fixture();
        let volume = provision(
            &space,
            chain.require("service").unwrap(),
            chain.require("storage").unwrap(),
            &spec("/opt/app", PosixOwner::new(0, 0), "755"),
        )
        .unwrap();
        let subnets: Vec<_> = volume.mount_targets.iter().map(|m| m.subnet.clone()).collect();
        assert_eq!(subnets, space.subnet_ids(SubnetTier::Private));
        assert!(volume.transit_encryption);
        assert!(volume.filesystem.encrypted);
        assert_eq!(volume.authorization, Authorization::Iam);
    }

    #[test]
    fn bad_mount_paths_rejected() {
        let (space, chain) = fixture();
        let service = chain.require("service").unwrap();
        let storage = chain.require("storage").unwrap();
        for path in ["", "opt/app", "/opt/../etc", "/opt/./app"] {
            let err = provision(&space, service, storage, &spec(path, PosixOwner::new(0, 0), "755")).unwrap_err();
            assert!(matches!(err, TopologyError::Validation { .. }), "{path:?}: {err}");
        }
    }

    #[test]
    fn storage_must_admit_the_client_tier() {
        let (space, chain) = fixture();
        // edge → storage skips a tier
        let err = provision(
            &space,
            chain.edge(),
            chain.require("storage").unwrap(),
            &spec("/opt/app", PosixOwner::new(0, 0), "755"),
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
        assert_eq!(err.entity(), "sg-storage");
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(FileMode::parse("755").unwrap().bits(), 0o755);
        assert_eq!(FileMode::parse("0750").unwrap().to_string(), "750");
        assert!(FileMode::parse("789").is_err());
        assert!(FileMode::parse("17777").is_err());
        assert!(FileMode::parse("").is_err());
    }

    #[test]
    fn write_access() {
        let ap = AccessPoint {
            id: "fsap".into(),
            path: "/opt/app".into(),
            owner: PosixOwner::new(1000, 1000),
            mode: FileMode::parse("755").unwrap(),
            posix_user: PosixOwner::new(1000, 1000),
        };
        assert!(ap.grants_write());

        let read_only = AccessPoint {
            mode: FileMode::parse("555").unwrap(),
            ..ap.clone()
        };
        assert!(!read_only.grants_write());

        let root_mapped = AccessPoint {
            posix_user: PosixOwner::new(0, 0),
            ..read_only
        };
        assert!(root_mapped.grants_write());
    }
}
