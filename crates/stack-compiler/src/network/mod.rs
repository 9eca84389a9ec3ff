//! Network fabric: one isolated address space split into public and private tiers.
//!
//! # Responsibilities
//!
//! - Parse the operator's CIDR block and carve fixed-mask subnets for every
//!   (subnet spec × availability zone) pair.
//! - Attach an internet gateway to the public tier and a NAT egress path to the
//!   private tier, with exactly one route table per tier.
//!
//! # Invariants
//!
//! - Subnets never overlap and always lie inside the block.
//! - Carving is deterministic: identical inputs produce an identical partition.
//! - Failure is always caller error (bad sizing), never transient.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

use common::{ResourceId, Result, TopologyError};
use oxnet::Ipv4Net;
use serde::{Serialize, Serializer};

/// Smallest subnet mask accepted by the fabric (largest block).
pub const MIN_SUBNET_MASK: u8 = 16;

/// Largest subnet mask accepted by the fabric (smallest block).
pub const MAX_SUBNET_MASK: u8 = 28;

/// Minimum number of availability zones a space must span.
pub const MIN_AZ_COUNT: u8 = 2;

/// Zones are lettered `a..=z` after the region name.
pub const MAX_AZ_COUNT: u8 = 26;

const ANY_IPV4: &str = "0.0.0.0/0";

/// Which side of the fabric a subnet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetTier {
    /// Internet-reachable, routed through the internet gateway.
    Public,
    /// Egress-only, routed through NAT.
    Private,
}

impl fmt::Display for SubnetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubnetTier::Public => f.write_str("public"),
            SubnetTier::Private => f.write_str("private"),
        }
    }
}

/// Request for one subnet per availability zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetSpec {
    pub name: String,
    pub tier: SubnetTier,
    pub mask: u8,
}

impl SubnetSpec {
    pub fn public(name: impl Into<String>, mask: u8) -> Self {
        Self {
            name: name.into(),
            tier: SubnetTier::Public,
            mask,
        }
    }

    pub fn private(name: impl Into<String>, mask: u8) -> Self {
        Self {
            name: name.into(),
            tier: SubnetTier::Private,
            mask,
        }
    }
}

/// One carved subnet.
#[derive(Debug, Clone, Serialize)]
pub struct Subnet {
    pub id: ResourceId,
    pub name: String,
    pub tier: SubnetTier,
    pub availability_zone: String,
    #[serde(serialize_with = "serialize_net")]
    pub cidr: Ipv4Net,
    pub route_table: ResourceId,
}

/// Where a default route leaves the space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RouteTarget {
    InternetGateway(ResourceId),
    NatGateway(ResourceId),
}

#[derive(Debug, Clone, Serialize)]
pub struct Route {
    pub destination: String,
    pub target: RouteTarget,
}

/// The single route table of a tier.
#[derive(Debug, Clone, Serialize)]
pub struct RouteTable {
    pub id: ResourceId,
    pub tier: SubnetTier,
    pub routes: Vec<Route>,
    pub subnets: Vec<ResourceId>,
}

/// NAT egress path for the private tier, homed in a public subnet.
#[derive(Debug, Clone, Serialize)]
pub struct NatGateway {
    pub id: ResourceId,
    pub subnet: ResourceId,
}

/// The allocated address space.
#[derive(Debug, Clone, Serialize)]
pub struct AddressSpace {
    pub id: ResourceId,
    pub region: String,
    #[serde(serialize_with = "serialize_net")]
    pub cidr: Ipv4Net,
    pub availability_zones: Vec<String>,
    pub subnets: Vec<Subnet>,
    pub route_tables: Vec<RouteTable>,
    pub internet_gateway: Option<ResourceId>,
    pub nat_gateway: Option<NatGateway>,
    pub dns_hostnames: bool,
    pub dns_support: bool,
    pub restrict_default_group: bool,
}

impl AddressSpace {
    /// Subnets of one tier, in allocation order.
    pub fn subnets_in(&self, tier: SubnetTier) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().filter(move |s| s.tier == tier)
    }

    /// Ids of the subnets of one tier, in allocation order.
    pub fn subnet_ids(&self, tier: SubnetTier) -> Vec<ResourceId> {
        self.subnets_in(tier).map(|s| s.id.clone()).collect()
    }

    pub fn has_tier(&self, tier: SubnetTier) -> bool {
        self.subnets_in(tier).next().is_some()
    }

    /// Number of addresses in the whole block.
    pub fn capacity(&self) -> u64 {
        block_size(self.cidr.width())
    }

    /// Number of addresses handed out to subnets.
    pub fn allocated(&self) -> u64 {
        self.subnets.iter().map(|s| block_size(s.cidr.width())).sum()
    }

    pub fn route_table(&self, tier: SubnetTier) -> Option<&RouteTable> {
        self.route_tables.iter().find(|t| t.tier == tier)
    }
}

/// Carve `specs` × `az_count` subnets out of `cidr`.
///
/// Subnets are laid out spec-major (every zone of the first spec, then every zone
/// of the second), each aligned to its own block size.
///
/// # Errors
///
/// - [`TopologyError::Validation`] for an unparsable CIDR, host bits set in the
///   block, a mask outside `16..=28` or wider than the block, or duplicate names.
/// - [`TopologyError::Config`] for fewer than two or more than 26 zones, no subnet specs, or a
///   private tier without a public tier to home the NAT gateway.
/// - [`TopologyError::Capacity`] when the block cannot hold every subnet.
pub fn allocate(
    region: &str,
    cidr: &str,
    az_count: u8,
    specs: &[SubnetSpec],
) -> Result<AddressSpace> {
    let block = parse_block(cidr)?;

    if az_count < MIN_AZ_COUNT {
        return Err(TopologyError::config(
            "address-space",
            format!("must span at least {MIN_AZ_COUNT} availability zones, got {az_count}"),
        ));
    }
    if az_count > MAX_AZ_COUNT {
        return Err(TopologyError::config(
            "address-space",
            format!("cannot span more than {MAX_AZ_COUNT} availability zones, got {az_count}"),
        ));
    }
    if specs.is_empty() {
        return Err(TopologyError::config(
            "address-space",
            "at least one subnet spec is required",
        ));
    }
    validate_specs(&block, specs)?;

    let has_public = specs.iter().any(|s| s.tier == SubnetTier::Public);
    let has_private = specs.iter().any(|s| s.tier == SubnetTier::Private);
    if has_private && !has_public {
        return Err(TopologyError::config(
            "address-space",
            "private subnets need a public subnet to home the NAT gateway",
        ));
    }

    let availability_zones: Vec<String> = (0..az_count).map(|i| zone_name(region, i)).collect();
    let base = u32::from(block.addr());
    let capacity = block_size(block.width());
    let mut cursor: u64 = 0;
    let mut subnets = Vec::with_capacity(specs.len() * usize::from(az_count));

    for spec in specs {
        let size = block_size(spec.mask);
        for (index, zone) in availability_zones.iter().enumerate() {
            let id = ResourceId::new(format!("subnet-{}-{}", spec.name, index + 1));
            let offset = align_up(cursor, size);
            if offset + size > capacity {
                return Err(TopologyError::capacity(
                    id.as_str(),
                    format!(
                        "/{} subnet does not fit in {block}: {cursor} of {capacity} addresses already allocated",
                        spec.mask
                    ),
                ));
            }
            // offset < capacity <= 2^32, so the sum stays inside the block
            let addr = Ipv4Addr::from(base + offset as u32);
            let cidr = Ipv4Net::new(addr, spec.mask).map_err(|e| {
                TopologyError::validation(id.as_str(), format!("invalid subnet /{}: {e}", spec.mask))
            })?;
            subnets.push(Subnet {
                id,
                name: spec.name.clone(),
                tier: spec.tier,
                availability_zone: zone.clone(),
                cidr,
                route_table: route_table_id(spec.tier),
            });
            cursor = offset + size;
        }
    }

    let internet_gateway = has_public.then(|| ResourceId::new("igw"));
    let nat_gateway = if has_private {
        subnets
            .iter()
            .find(|s| s.tier == SubnetTier::Public)
            .map(|s| NatGateway {
                id: ResourceId::new("nat-1"),
                subnet: s.id.clone(),
            })
    } else {
        None
    };

    let mut route_tables = Vec::new();
    if let Some(igw) = &internet_gateway {
        route_tables.push(route_table(
            SubnetTier::Public,
            RouteTarget::InternetGateway(igw.clone()),
            &subnets,
        ));
    }
    if let Some(nat) = &nat_gateway {
        route_tables.push(route_table(
            SubnetTier::Private,
            RouteTarget::NatGateway(nat.id.clone()),
            &subnets,
        ));
    }

    tracing::debug!(
        cidr = %block,
        subnets = subnets.len(),
        allocated = cursor,
        capacity,
        "address space allocated"
    );

    Ok(AddressSpace {
        id: ResourceId::new("vpc"),
        region: region.to_string(),
        cidr: block,
        availability_zones,
        subnets,
        route_tables,
        internet_gateway,
        nat_gateway,
        dns_hostnames: true,
        dns_support: true,
        restrict_default_group: true,
    })
}

/// Parse a CIDR block, rejecting host bits.
pub fn parse_block(cidr: &str) -> Result<Ipv4Net> {
    let block: Ipv4Net = cidr
        .trim()
        .parse()
        .map_err(|e| TopologyError::validation("address-space", format!("invalid CIDR {cidr:?}: {e}")))?;
    let addr = u32::from(block.addr());
    if addr & host_mask(block.width()) != 0 {
        return Err(TopologyError::validation(
            "address-space",
            format!("CIDR {cidr} has host bits set"),
        ));
    }
    Ok(block)
}

fn validate_specs(block: &Ipv4Net, specs: &[SubnetSpec]) -> Result<()> {
    let mut names = HashSet::new();
    for spec in specs {
        let entity = format!("subnet-spec-{}", spec.name);
        if spec.name.trim().is_empty() {
            return Err(TopologyError::validation(entity, "subnet name must not be empty"));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(TopologyError::validation(entity, "duplicate subnet name"));
        }
        if !(MIN_SUBNET_MASK..=MAX_SUBNET_MASK).contains(&spec.mask) {
            return Err(TopologyError::validation(
                entity,
                format!(
                    "mask /{} outside /{MIN_SUBNET_MASK}../{MAX_SUBNET_MASK}",
                    spec.mask
                ),
            ));
        }
        if spec.mask < block.width() {
            return Err(TopologyError::validation(
                entity,
                format!("mask /{} is wider than the block {block}", spec.mask),
            ));
        }
    }
    Ok(())
}

fn route_table(tier: SubnetTier, target: RouteTarget, subnets: &[Subnet]) -> RouteTable {
    RouteTable {
        id: route_table_id(tier),
        tier,
        routes: vec![Route {
            destination: ANY_IPV4.to_owned(),
            target,
        }],
        subnets: subnets
            .iter()
            .filter(|s| s.tier == tier)
            .map(|s| s.id.clone())
            .collect(),
    }
}

fn route_table_id(tier: SubnetTier) -> ResourceId {
    ResourceId::new(format!("rtb-{tier}"))
}

fn zone_name(region: &str, index: u8) -> String {
    let letter = char::from_digit(10 + u32::from(index), 36).unwrap_or('z');
    format!("{region}{letter}")
}

fn block_size(width: u8) -> u64 {
    1u64 << (32 - u32::from(width))
}

fn host_mask(width: u8) -> u32 {
    (block_size(width) - 1) as u32
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Serialize an [`Ipv4Net`] in `a.b.c.d/n` form.
pub fn serialize_net<S: Serializer>(net: &Ipv4Net, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(net)
}
