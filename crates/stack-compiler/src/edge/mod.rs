//! Edge termination: the public network load balancer and its listeners.
//!
//! A listener moves `Declared → Bound → Serving` and never back. Changing what
//! a serving listener forwards to goes through [`Listener::swap_targets`], which
//! builds the next generation and leaves the current one untouched on failure.

pub mod offline;
pub mod provider;

use std::collections::BTreeSet;

use common::{Protocol, ResourceId, Result, TopologyError};
use serde::Serialize;
use tracing::info;

use crate::access::PermissionGroup;
use crate::compute::ServiceInstance;
use crate::naming::Certificate;
use crate::network::{AddressSpace, SubnetTier};

pub use offline::OfflineDirectory;
pub use provider::LoadBalancerDirectory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadBalancer {
    pub id: ResourceId,
    pub name: String,
    pub scheme: String,
    /// Network identity reported by the [`LoadBalancerDirectory`].
    pub dns_name: String,
    pub subnets: Vec<ResourceId>,
    pub security_group: ResourceId,
    /// Ports the edge group publishes.
    pub published_ports: BTreeSet<u16>,
    /// Ports already bound by a listener.
    pub listener_ports: BTreeSet<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Declared,
    Bound,
    Serving,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub protocol: Protocol,
    pub port: u16,
    pub interval_secs: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl HealthCheck {
    fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port,
            interval_secs: 30,
            healthy_threshold: 3,
            unhealthy_threshold: 3,
        }
    }
}

/// Where a listener forwards: a target group of service instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetAttachment {
    pub target_group: ResourceId,
    pub target_port: u16,
    pub target_protocol: Protocol,
    pub targets: Vec<ResourceId>,
    pub health_check: HealthCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub id: ResourceId,
    pub load_balancer: ResourceId,
    pub port: u16,
    pub protocol: Protocol,
    pub certificate: Option<ResourceId>,
    pub state: ListenerState,
    pub generation: u32,
    pub attachments: Vec<TargetAttachment>,
    #[serde(skip)]
    edge_group: ResourceId,
}

impl Listener {
    pub fn is_serving(&self) -> bool {
        self.state == ListenerState::Serving
    }

    /// The (listener port, target port) pair of the first attachment.
    pub fn mapping(&self) -> Option<(u16, u16)> {
        self.attachments.first().map(|a| (self.port, a.target_port))
    }

    /// Build the next generation of this listener forwarding to new targets.
    ///
    /// The current listener is not modified. On error nothing changes.
    pub fn swap_targets(
        &self,
        target_port: u16,
        target_protocol: Protocol,
        instances: &[ServiceInstance],
        group: &PermissionGroup,
    ) -> Result<Listener> {
        if !self.is_serving() {
            return Err(TopologyError::config(
                self.id.as_str(),
                "only a serving listener can swap targets",
            ));
        }
        let next = Listener {
            generation: self.generation + 1,
            state: ListenerState::Bound,
            attachments: Vec::new(),
            ..self.clone()
        };
        attach_targets(next, target_port, target_protocol, instances, group)
    }
}

/// Create the internet-facing load balancer `name` in the public tier.
///
/// The placement is checked before `directory` is asked for the DNS name.
///
/// # Errors
///
/// - [`TopologyError::Config`] for a non-public tier, a group that is not an
///   edge group, or a space without public subnets.
/// - [`TopologyError::Substrate`] when the directory cannot name the load balancer.
pub async fn create_load_balancer(
    directory: &dyn LoadBalancerDirectory,
    name: &str,
    space: &AddressSpace,
    group: &PermissionGroup,
    tier: SubnetTier,
) -> Result<LoadBalancer> {
    let id = ResourceId::new("nlb");
    if name.trim().is_empty() {
        return Err(TopologyError::validation(id.as_str(), "load balancer name must not be empty"));
    }
    if tier != SubnetTier::Public {
        return Err(TopologyError::config(
            id.as_str(),
            "the load balancer must be placed in the public tier",
        ));
    }
    if !group.is_edge() {
        return Err(TopologyError::config(
            id.as_str(),
            format!("{} is not an edge group", group.id),
        ));
    }
    let subnets = space.subnet_ids(SubnetTier::Public);
    if subnets.is_empty() {
        return Err(TopologyError::config(id.as_str(), "address space has no public subnets"));
    }

    let dns_name = directory
        .dns_name(name, &space.region)
        .await
        .map_err(|e| TopologyError::substrate(id.as_str(), e.code, e.message))?;

    info!(load_balancer = %id, dns_name = %dns_name, "load balancer created");
    Ok(LoadBalancer {
        id,
        name: name.to_string(),
        scheme: "internet-facing".to_string(),
        dns_name,
        subnets,
        security_group: group.id.clone(),
        published_ports: group.open_ports(),
        listener_ports: BTreeSet::new(),
    })
}

/// Declare a listener on `lb` and bind it to its certificate.
///
/// # Errors
///
/// Returns [`TopologyError::Config`] when:
/// - `protocol` is TLS and `certificate` is absent or not issued;
/// - `protocol` is TCP and a certificate is given;
/// - `port` is already bound or is not published by the edge group.
pub fn add_listener(
    lb: &mut LoadBalancer,
    port: u16,
    protocol: Protocol,
    certificate: Option<&Certificate>,
) -> Result<Listener> {
    let mut listener = Listener {
        id: ResourceId::new(format!("listener-{port}")),
        load_balancer: lb.id.clone(),
        port,
        protocol,
        certificate: None,
        state: ListenerState::Declared,
        generation: 1,
        attachments: Vec::new(),
        edge_group: lb.security_group.clone(),
    };
    let entity = listener.id.to_string();

    if lb.listener_ports.contains(&port) {
        return Err(TopologyError::config(&entity, format!("port {port} already has a listener")));
    }
    if !lb.published_ports.contains(&port) {
        return Err(TopologyError::config(
            &entity,
            format!("port {port} is not published by {}", lb.security_group),
        ));
    }

    match (protocol.requires_certificate(), certificate) {
        (true, None) => {
            return Err(TopologyError::config(&entity, format!("{protocol} listener requires a certificate")))
        }
        (true, Some(cert)) if !cert.is_issued() => {
            return Err(TopologyError::config(
                &entity,
                format!("certificate {} is {:?}, not issued", cert.id, cert.state),
            ))
        }
        (true, Some(cert)) => listener.certificate = Some(cert.id.clone()),
        (false, Some(cert)) => {
            return Err(TopologyError::config(
                &entity,
                format!("{protocol} listener must not reference certificate {}", cert.id),
            ))
        }
        (false, None) => {}
    }

    lb.listener_ports.insert(port);
    listener.state = ListenerState::Bound;
    info!(listener = %listener.id, %protocol, "listener bound");
    Ok(listener)
}

/// Forward a bound listener to `target_port` on `instances`.
///
/// # Errors
///
/// Returns [`TopologyError::Config`] when the listener is not bound, there are
/// no instances, an instance sits outside `group` or does not listen on
/// `target_port`, the target protocol is TLS, or `group` does not admit the
/// edge group on `target_port`.
pub fn attach_targets(
    mut listener: Listener,
    target_port: u16,
    target_protocol: Protocol,
    instances: &[ServiceInstance],
    group: &PermissionGroup,
) -> Result<Listener> {
    let entity = listener.id.to_string();

    if listener.state != ListenerState::Bound {
        return Err(TopologyError::config(
            &entity,
            format!("cannot attach targets in state {:?}", listener.state),
        ));
    }
    if target_protocol != Protocol::Tcp {
        return Err(TopologyError::config(
            &entity,
            "targets receive plain TCP; TLS terminates at the listener",
        ));
    }
    if instances.is_empty() {
        return Err(TopologyError::config(&entity, "no service instances to attach"));
    }
    for instance in instances {
        if instance.security_group != group.id {
            return Err(TopologyError::config(
                &entity,
                format!("{} is in {}, not {}", instance.id, instance.security_group, group.id),
            ));
        }
        if !instance.ports.contains(&target_port) {
            return Err(TopologyError::config(
                &entity,
                format!("{} does not listen on {target_port}", instance.id),
            ));
        }
    }
    if !group.admits_group(&listener.edge_group, target_port) {
        return Err(TopologyError::config(
            &entity,
            format!(
                "target port {target_port} is not opened to {} in {}",
                listener.edge_group, group.id
            ),
        ));
    }

    listener.attachments = vec![TargetAttachment {
        target_group: ResourceId::new(format!("tg-{target_port}")),
        target_port,
        target_protocol,
        targets: instances.iter().map(|i| i.id.clone()).collect(),
        health_check: HealthCheck::tcp(target_port),
    }];
    listener.state = ListenerState::Serving;
    info!(
        listener = %listener.id,
        generation = listener.generation,
        port = listener.port,
        target_port,
        "listener serving"
    );
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::provider::MockLoadBalancerDirectory;
    use super::*;
    use crate::access::AccessChain;
    use crate::naming::ProviderError;
    use crate::compute::InstanceHandle;
    use crate::naming::CertificateState;
    use crate::testing;

    fn instance(chain: &AccessChain, space: &AddressSpace) -> ServiceInstance {
        ServiceInstance {
            id: "service-app".into(),
            handle: InstanceHandle("fargate://cluster/app-cluster/service/1".into()),
            cluster: "cluster-app-cluster".into(),
            task: "task-app".into(),
            task_revision: "r1".into(),
            ports: vec![6610, 6611],
            tier: SubnetTier::Private,
            subnets: space.subnet_ids(SubnetTier::Private),
            security_group: chain.require("service").unwrap().id.clone(),
            assign_public_ip: false,
            desired_count: 1,
        }
    }

    fn certificate(state: CertificateState) -> Certificate {
        Certificate {
            id: "cert-app.example.com".into(),
            handle: "offline-cert".into(),
            domain_name: "app.example.com".into(),
            zone: "z".into(),
            state,
        }
    }

    async fn load_balancer(space: &AddressSpace, chain: &AccessChain) -> LoadBalancer {
        create_load_balancer(&OfflineDirectory, "edge-nlb", space, chain.edge(), SubnetTier::Public)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn load_balancer_is_public_and_named_by_the_directory() {
        let (space, chain) = (testing::space(), testing::access());
        let a = load_balancer(&space, &chain).await;
        let b = load_balancer(&space, &chain).await;
        assert_eq!(a.dns_name, b.dns_name);
        assert_eq!(a.name, "edge-nlb");
        assert!(a.dns_name.ends_with(".elb.us-east-1.amazonaws.com"));
        assert_eq!(a.subnets, space.subnet_ids(SubnetTier::Public));

        let err = create_load_balancer(&OfflineDirectory, "edge-nlb", &space, chain.edge(), SubnetTier::Private)
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
        let service = chain.require("service").unwrap();
        let err = create_load_balancer(&OfflineDirectory, "edge-nlb", &space, service, SubnetTier::Public)
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
    }

    #[tokio::test]
    async fn dns_name_comes_from_the_directory() {
        let (space, chain) = (testing::space(), testing::access());
        let mut directory = MockLoadBalancerDirectory::new();
        directory
            .expect_dns_name()
            .times(1)
            .returning(|_, _| Ok("shop-nlb-0123.elb.us-east-1.amazonaws.com".into()));
        let lb = create_load_balancer(&directory, "shop-nlb", &space, chain.edge(), SubnetTier::Public)
            .await
            .unwrap();
        assert_eq!(lb.dns_name, "shop-nlb-0123.elb.us-east-1.amazonaws.com");
        assert_eq!(lb.name, "shop-nlb");
    }

    #[tokio::test]
    async fn missing_load_balancer_is_a_substrate_error() {
        let (space, chain) = (testing::space(), testing::access());
        let mut directory = MockLoadBalancerDirectory::new();
        directory
            .expect_dns_name()
            .returning(|_, _| Err(ProviderError::new("LoadBalancerNotFound", "no load balancer named edge-nlb")));
        let err = create_load_balancer(&directory, "edge-nlb", &space, chain.edge(), SubnetTier::Public)
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::Substrate { ref code, .. } if code == "LoadBalancerNotFound"));
        assert_eq!(err.entity(), "nlb");
    }

    #[tokio::test]
    async fn placement_is_checked_before_the_directory() {
        let (space, chain) = (testing::space(), testing::access());
        let mut directory = MockLoadBalancerDirectory::new();
        directory.expect_dns_name().times(0);
        let err = create_load_balancer(&directory, "edge-nlb", &space, chain.edge(), SubnetTier::Private)
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
    }

    #[tokio::test]
    async fn tls_listener_needs_an_issued_certificate() {
        let (space, chain) = (testing::space(), testing::access());
        let mut lb = load_balancer(&space, &chain).await;

        let pending = certificate(CertificateState::PendingValidation);
        let err = add_listener(&mut lb, 443, Protocol::Tls, Some(&pending)).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
        assert_eq!(err.entity(), "listener-443");

        let err = add_listener(&mut lb, 443, Protocol::Tls, None).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));

        let issued = certificate(CertificateState::Issued);
        let listener = add_listener(&mut lb, 443, Protocol::Tls, Some(&issued)).unwrap();
        assert_eq!(listener.state, ListenerState::Bound);
        assert_eq!(listener.certificate, Some(issued.id.clone()));

        let err = add_listener(&mut lb, 443, Protocol::Tls, Some(&issued)).unwrap_err();
        assert!(err.to_string().contains("already has a listener"));
    }

    #[tokio::test]
    async fn tcp_listener_refuses_a_certificate() {
        let (space, chain) = (testing::space(), testing::access());
        let mut lb = load_balancer(&space, &chain).await;
        let issued = certificate(CertificateState::Issued);
        let err = add_listener(&mut lb, 22, Protocol::Tcp, Some(&issued)).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
        assert!(add_listener(&mut lb, 22, Protocol::Tcp, None).is_ok());
        assert!(add_listener(&mut lb, 8080, Protocol::Tcp, None).is_err());
    }

    #[tokio::test]
    async fn attaches_and_serves() {
        let (space, chain) = (testing::space(), testing::access());
        let service = chain.require("service").unwrap();
        let mut lb = load_balancer(&space, &chain).await;
        let instances = [instance(&chain, &space)];

        let tls = add_listener(&mut lb, 443, Protocol::Tls, Some(&certificate(CertificateState::Issued))).unwrap();
        let tls = attach_targets(tls, 6610, Protocol::Tcp, &instances, service).unwrap();
        let ssh = add_listener(&mut lb, 22, Protocol::Tcp, None).unwrap();
        let ssh = attach_targets(ssh, 6611, Protocol::Tcp, &instances, service).unwrap();

        assert!(tls.is_serving() && ssh.is_serving());
        assert_eq!(tls.mapping(), Some((443, 6610)));
        assert_eq!(ssh.mapping(), Some((22, 6611)));
        assert_eq!(tls.attachments[0].health_check.protocol, Protocol::Tcp);

        let err = attach_targets(tls, 6610, Protocol::Tcp, &instances, service).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
    }

    #[tokio::test]
    async fn unopened_target_port_is_rejected() {
        let (space, chain) = (testing::space(), testing::access());
        let service = chain.require("service").unwrap();
        let mut lb = load_balancer(&space, &chain).await;
        let mut inst = instance(&chain, &space);
        inst.ports.push(7000);

        let listener = add_listener(&mut lb, 22, Protocol::Tcp, None).unwrap();
        let err = attach_targets(listener, 7000, Protocol::Tcp, &[inst], service).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
        assert!(err.to_string().contains("7000"));
    }

    #[tokio::test]
    async fn attach_checks_instances() {
        let (space, chain) = (testing::space(), testing::access());
        let service = chain.require("service").unwrap();
        let mut lb = load_balancer(&space, &chain).await;
        let listener = add_listener(&mut lb, 22, Protocol::Tcp, None).unwrap();

        assert!(attach_targets(listener.clone(), 6611, Protocol::Tcp, &[], service).is_err());

        let mut stray = instance(&chain, &space);
        stray.security_group = "sg-other".into();
        assert!(attach_targets(listener.clone(), 6611, Protocol::Tcp, &[stray], service).is_err());

        let inst = instance(&chain, &space);
        assert!(attach_targets(listener, 6611, Protocol::Tls, &[inst], service).is_err());
    }

    #[tokio::test]
    async fn swap_builds_a_new_generation() {
        let (space, chain) = (testing::space(), testing::access());
        let service = chain.require("service").unwrap();
        let mut lb = load_balancer(&space, &chain).await;
        let first = instance(&chain, &space);
        let listener = add_listener(&mut lb, 22, Protocol::Tcp, None).unwrap();
        let serving = attach_targets(listener, 6611, Protocol::Tcp, &[first.clone()], service).unwrap();

        let mut replacement = first;
        replacement.id = "service-app-2".into();
        let next = serving
            .swap_targets(6611, Protocol::Tcp, &[replacement], service)
            .unwrap();
        assert_eq!(next.generation, 2);
        assert!(next.is_serving());
        assert_eq!(next.attachments[0].targets, vec![ResourceId::from("service-app-2")]);
        assert_eq!(serving.attachments[0].targets, vec![ResourceId::from("service-app")]);

        assert!(serving.swap_targets(7000, Protocol::Tcp, &[], service).is_err());
        assert_eq!(serving.generation, 1);
    }
}
