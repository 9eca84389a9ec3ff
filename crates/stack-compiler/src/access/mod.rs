//! Access control layer: chained permission groups (edge → service → storage).
//!
//! The chain invariant is enforced by construction. Only [`PermissionGroup::edge`]
//! can produce internet or address-range sources, and it refuses any published
//! port whose exposure was not stated explicitly. Every later tier is built by
//! [`PermissionGroup::downstream`], which accepts nothing but the upstream group
//! object, so a rule that skips a tier cannot be expressed.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use common::{Protocol, ResourceId, Result, TopologyError};
use oxnet::Ipv4Net;
use serde::Serialize;

use crate::network::serialize_net;

pub const EDGE_TIER: &str = "edge";
pub const SERVICE_TIER: &str = "service";
pub const STORAGE_TIER: &str = "storage";

/// Where inbound traffic may come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Source {
    /// Any IPv4 address.
    Internet,
    /// A declared address range. Only valid on the edge tier.
    Range(#[serde(serialize_with = "serialize_net")] Ipv4Net),
    /// Members of another permission group.
    Group(ResourceId),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Internet => f.write_str("0.0.0.0/0"),
            Source::Range(net) => write!(f, "{net}"),
            Source::Group(id) => write!(f, "{id}"),
        }
    }
}

/// Explicit acknowledgment of how far a published edge port is exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exposure {
    Anywhere,
    Ranges(Vec<Ipv4Net>),
}

impl Exposure {
    /// Parse `"anywhere"` or a comma-separated list of CIDR ranges.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Config`] for an empty value (exposure must be
    /// stated) and [`TopologyError::Validation`] for an unparsable range.
    pub fn parse(entity: &str, value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(TopologyError::config(
                entity,
                "public exposure must be stated explicitly (\"anywhere\" or CIDR ranges)",
            ));
        }
        if value.eq_ignore_ascii_case("anywhere") {
            return Ok(Exposure::Anywhere);
        }
        let ranges = value
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| {
                r.parse::<Ipv4Net>()
                    .map_err(|e| TopologyError::validation(entity, format!("invalid range {r:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Exposure::Ranges(ranges))
    }

    fn sources(&self) -> Vec<Source> {
        match self {
            Exposure::Anywhere => vec![Source::Internet],
            Exposure::Ranges(ranges) => ranges.iter().cloned().map(Source::Range).collect(),
        }
    }
}

/// One port a tier listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressPort {
    pub port: u16,
    pub protocol: Protocol,
    pub description: String,
    /// Required on the edge tier, forbidden on every other tier.
    pub exposure: Option<Exposure>,
}

impl IngressPort {
    pub fn tcp(port: u16, description: impl Into<String>) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            description: description.into(),
            exposure: None,
        }
    }

    pub fn exposed(mut self, exposure: Exposure) -> Self {
        self.exposure = Some(exposure);
        self
    }
}

/// Declaration of one tier of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSpec {
    pub name: String,
    pub description: String,
    pub ports: Vec<IngressPort>,
}

impl TierSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, ports: Vec<IngressPort>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ports,
        }
    }
}

/// A single inbound rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressRule {
    pub source: Source,
    pub protocol: Protocol,
    pub port: u16,
    pub description: String,
}

/// A named set of inbound rules.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionGroup {
    pub id: ResourceId,
    pub name: String,
    pub description: String,
    /// Group this tier accepts traffic from; `None` on the edge tier.
    pub upstream: Option<ResourceId>,
    pub rules: Vec<IngressRule>,
    pub allow_all_outbound: bool,
}

impl PermissionGroup {
    /// Build the first tier. Each published port must carry an explicit [`Exposure`].
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Config`] when a port has no exposure or declares an
    /// empty range list, or when the tier has no ports.
    pub fn edge(spec: &TierSpec) -> Result<Self> {
        let id = group_id(&spec.name);
        validate_ports(&id, spec)?;

        let mut rules = Vec::new();
        for port in &spec.ports {
            let exposure = port.exposure.as_ref().ok_or_else(|| {
                TopologyError::config(
                    id.as_str(),
                    format!(
                        "edge port {} has no declared exposure; open exposure must be acknowledged explicitly",
                        port.port
                    ),
                )
            })?;
            let sources = exposure.sources();
            if sources.is_empty() {
                return Err(TopologyError::config(
                    id.as_str(),
                    format!("edge port {} declares an empty range list", port.port),
                ));
            }
            rules.extend(sources.into_iter().map(|source| IngressRule {
                source,
                protocol: port.protocol.transport(),
                port: port.port,
                description: port.description.clone(),
            }));
        }

        Ok(Self {
            id,
            name: spec.name.clone(),
            description: spec.description.clone(),
            upstream: None,
            rules,
            allow_all_outbound: true,
        })
    }

    /// Build a tier reachable only from `upstream`.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Config`] if any port declares an exposure (raw
    /// ranges are only valid on the edge tier) or the tier has no ports.
    pub fn downstream(spec: &TierSpec, upstream: &PermissionGroup) -> Result<Self> {
        let id = group_id(&spec.name);
        validate_ports(&id, spec)?;

        if let Some(port) = spec.ports.iter().find(|p| p.exposure.is_some()) {
            return Err(TopologyError::config(
                id.as_str(),
                format!(
                    "port {} declares an address exposure; tiers past the edge accept only their upstream group",
                    port.port
                ),
            ));
        }

        let rules = spec
            .ports
            .iter()
            .map(|port| IngressRule {
                source: Source::Group(upstream.id.clone()),
                protocol: port.protocol.transport(),
                port: port.port,
                description: port.description.clone(),
            })
            .collect();

        Ok(Self {
            id,
            name: spec.name.clone(),
            description: spec.description.clone(),
            upstream: Some(upstream.id.clone()),
            rules,
            allow_all_outbound: true,
        })
    }

    /// Whether traffic from `source` may reach `port`.
    pub fn admits(&self, source: &Source, port: u16) -> bool {
        self.rules.iter().any(|r| &r.source == source && r.port == port)
    }

    /// Whether members of `group` may reach `port`.
    pub fn admits_group(&self, group: &ResourceId, port: u16) -> bool {
        self.admits(&Source::Group(group.clone()), port)
    }

    /// Every port opened by at least one rule.
    pub fn open_ports(&self) -> BTreeSet<u16> {
        self.rules.iter().map(|r| r.port).collect()
    }

    /// Edge groups are the only ones without an upstream group.
    pub fn is_edge(&self) -> bool {
        self.upstream.is_none()
    }
}

/// An ordered chain of permission groups.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct AccessChain {
    groups: Vec<PermissionGroup>,
}

impl AccessChain {
    pub fn groups(&self) -> &[PermissionGroup] {
        &self.groups
    }

    /// The first (edge) tier.
    pub fn edge(&self) -> &PermissionGroup {
        &self.groups[0]
    }

    /// Look up a tier by name.
    pub fn get(&self, name: &str) -> Option<&PermissionGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Look up a tier by name, failing with a config error naming the tier.
    pub fn require(&self, name: &str) -> Result<&PermissionGroup> {
        self.get(name)
            .ok_or_else(|| TopologyError::config(group_id(name).as_str(), "tier missing from access chain"))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Build a chain where every tier past the first is sourced from its predecessor.
///
/// # Errors
///
/// Returns [`TopologyError::Config`] for an empty tier list, duplicate tier
/// names, or any error from the group constructors.
pub fn chain(tiers: &[TierSpec]) -> Result<AccessChain> {
    let (first, rest) = tiers
        .split_first()
        .ok_or_else(|| TopologyError::config("access-chain", "at least one tier is required"))?;

    let mut names = HashSet::new();
    for tier in tiers {
        if !names.insert(tier.name.as_str()) {
            return Err(TopologyError::config(
                group_id(&tier.name).as_str(),
                "duplicate tier name in access chain",
            ));
        }
    }

    let mut groups = Vec::with_capacity(tiers.len());
    groups.push(PermissionGroup::edge(first)?);
    for tier in rest {
        let upstream = &groups[groups.len() - 1];
        let group = PermissionGroup::downstream(tier, upstream)?;
        groups.push(group);
    }

    for group in &groups {
        tracing::debug!(group = %group.id, rules = group.rules.len(), "permission group built");
    }
    Ok(AccessChain { groups })
}

fn validate_ports(id: &ResourceId, spec: &TierSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(TopologyError::validation("access-chain", "tier name must not be empty"));
    }
    if spec.ports.is_empty() {
        return Err(TopologyError::config(id.as_str(), "tier must open at least one port"));
    }
    if spec.ports.iter().any(|p| p.port == 0) {
        return Err(TopologyError::validation(id.as_str(), "port 0 is not a valid ingress port"));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = spec.ports.iter().find(|p| !seen.insert(p.port)) {
        return Err(TopologyError::config(
            id.as_str(),
            format!("port {} is declared more than once", dup.port),
        ));
    }
    Ok(())
}

fn group_id(name: &str) -> ResourceId {
    ResourceId::new(format!("sg-{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers(admin: Option<Exposure>) -> Vec<TierSpec> {
        let mut ssh = IngressPort::tcp(22, "SSH");
        if let Some(e) = admin {
            ssh = ssh.exposed(e);
        }
        vec![
            TierSpec::new(
                "edge",
                "load balancer",
                vec![IngressPort::tcp(443, "HTTPS").exposed(Exposure::Anywhere), ssh],
            ),
            TierSpec::new(
                "service",
                "application",
                vec![IngressPort::tcp(6610, "app"), IngressPort::tcp(6611, "ssh")],
            ),
            TierSpec::new("storage", "filesystem", vec![IngressPort::tcp(2049, "NFS")]),
        ]
    }

    #[test]
    fn every_rule_comes_from_the_immediate_upstream() {
        let admin = Exposure::parse("admin", "203.0.113.0/24").unwrap();
        let chain = chain(&tiers(Some(admin))).unwrap();
        assert_eq!(chain.len(), 3);

        for (k, group) in chain.groups().iter().enumerate() {
            for rule in &group.rules {
                match (&rule.source, k) {
                    (Source::Internet | Source::Range(_), 0) => {}
                    (Source::Group(id), k) if k > 0 => assert_eq!(id, &chain.groups()[k - 1].id),
                    (source, k) => panic!("tier {k} has illegal source {source}"),
                }
            }
        }
    }

    #[test]
    fn storage_is_unreachable_from_edge() {
        let chain = chain(&tiers(Some(Exposure::Anywhere))).unwrap();
        let edge = chain.edge();
        let storage = chain.require("storage").unwrap();
        assert!(!storage.admits_group(&edge.id, 2049));
        assert!(storage.admits_group(&chain.require("service").unwrap().id, 2049));
        assert!(!storage.admits(&Source::Internet, 2049));
    }

    #[test]
    fn service_opens_exactly_its_ports() {
        let chain = chain(&tiers(Some(Exposure::Anywhere))).unwrap();
        let service = chain.require("service").unwrap();
        assert_eq!(service.open_ports().into_iter().collect::<Vec<_>>(), vec![6610, 6611]);
        assert!(!service.admits_group(&chain.edge().id, 443));
    }

    #[test]
    fn edge_port_without_exposure_is_config_error() {
        let err = chain(&tiers(None)).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }), "{err}");
        assert_eq!(err.entity(), "sg-edge");
        assert!(err.to_string().contains("port 22"));
    }

    #[test]
    fn port_declared_twice_in_a_tier_is_config_error() {
        let mut service = tiers(Some(Exposure::Anywhere));
        service[1].ports.push(IngressPort::tcp(6610, "app again"));
        let err = chain(&service).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }), "{err}");
        assert_eq!(err.entity(), "sg-service");
        assert!(err.to_string().contains("port 6610"));

        let mut edge = tiers(Some(Exposure::Anywhere));
        edge[0].ports.push(IngressPort::tcp(443, "HTTPS").exposed(Exposure::Anywhere));
        assert_eq!(chain(&edge).unwrap_err().entity(), "sg-edge");
    }

    #[test]
    fn downstream_exposure_is_config_error() {
        let edge = PermissionGroup::edge(&tiers(Some(Exposure::Anywhere))[0]).unwrap();
        let leaky = TierSpec::new(
            "service",
            "application",
            vec![IngressPort::tcp(6610, "app").exposed(Exposure::Anywhere)],
        );
        let err = PermissionGroup::downstream(&leaky, &edge).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
    }

    #[test]
    fn range_exposure_produces_one_rule_per_range() {
        let exposure = Exposure::parse("admin", "198.51.100.0/24, 203.0.113.7/32").unwrap();
        let spec = TierSpec::new("edge", "lb", vec![IngressPort::tcp(22, "SSH").exposed(exposure)]);
        let edge = PermissionGroup::edge(&spec).unwrap();
        assert_eq!(edge.rules.len(), 2);
        assert!(edge.rules.iter().all(|r| matches!(r.source, Source::Range(_))));
        assert!(!edge.admits(&Source::Internet, 22));
    }

    #[test]
    fn exposure_parsing() {
        assert_eq!(Exposure::parse("x", "Anywhere").unwrap(), Exposure::Anywhere);
        assert!(matches!(Exposure::parse("x", "  "), Err(TopologyError::Config { .. })));
        assert!(matches!(
            Exposure::parse("x", "10.0.0.0/33"),
            Err(TopologyError::Validation { .. })
        ));
    }

    #[test]
    fn structural_errors() {
        assert!(matches!(chain(&[]), Err(TopologyError::Config { .. })));

        let mut dup = tiers(Some(Exposure::Anywhere));
        dup[2].name = "service".into();
        assert!(matches!(chain(&dup), Err(TopologyError::Config { .. })));

        let mut empty = tiers(Some(Exposure::Anywhere));
        empty[1].ports.clear();
        assert!(matches!(chain(&empty), Err(TopologyError::Config { .. })));
    }
}
