//! Executes a [`BuildPlan`] against a [`Config`] and the external collaborators.
//!
//! Each node reads only the outputs of nodes it requires. Asking for an output
//! that has not been built yet is a [`TopologyError::Config`] naming both nodes,
//! so an ordering bug in a plan fails loudly instead of building out of order.

use std::collections::BTreeMap;
use std::slice;

use common::{Protocol, ResourceId, TopologyError};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use super::{BuildPlan, Node};
use crate::access::{chain, AccessChain, SERVICE_TIER, STORAGE_TIER};
use crate::compute::{self, Cluster, ComputeSubstrate, ServiceInstance, TaskSpec};
use crate::config::Config;
use crate::edge::{self, Listener, LoadBalancer, LoadBalancerDirectory};
use crate::naming::{self, Certificate, CertificateAuthority, DnsProvider, DnsRecord, Zone};
use crate::network::{allocate, AddressSpace, SubnetTier};
use crate::storage::{provision, Volume};
use crate::tags::{self, TagSet};

/// A completed build. Nothing in it changes after construction.
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub plan: Vec<Node>,
    pub address_space: AddressSpace,
    pub access: AccessChain,
    pub volume: Volume,
    pub cluster: Cluster,
    pub task: TaskSpec,
    pub service: ServiceInstance,
    pub zone: Zone,
    pub certificate: Certificate,
    pub load_balancer: LoadBalancer,
    pub dns_record: DnsRecord,
    pub listeners: Vec<Listener>,
    pub tags: TagSet,
}

impl Deployment {
    /// Every taggable resource, in a stable order.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let space = &self.address_space;
        let mut ids = vec![space.id.clone()];
        ids.extend(space.subnets.iter().map(|s| s.id.clone()));
        ids.extend(space.route_tables.iter().map(|t| t.id.clone()));
        ids.extend(space.internet_gateway.iter().cloned());
        ids.extend(space.nat_gateway.iter().map(|n| n.id.clone()));
        ids.extend(self.access.groups().iter().map(|g| g.id.clone()));
        ids.push(self.volume.filesystem.id.clone());
        ids.push(self.volume.access_point.id.clone());
        ids.extend(self.volume.mount_targets.iter().map(|m| m.id.clone()));
        ids.push(self.cluster.id.clone());
        ids.push(self.task.id.clone());
        ids.push(self.service.id.clone());
        ids.push(self.certificate.id.clone());
        ids.push(self.load_balancer.id.clone());
        for listener in &self.listeners {
            ids.push(listener.id.clone());
            ids.extend(listener.attachments.iter().map(|a| a.target_group.clone()));
        }
        ids
    }

    pub fn listener(&self, port: u16) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.port == port)
    }
}

/// The first error of a failed build.
///
/// `completed` lists the nodes that finished before the failure, for
/// diagnostics only; none of their output is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct BuildFailure {
    pub error: TopologyError,
    pub completed: Vec<Node>,
}

impl BuildFailure {
    fn new(error: TopologyError, completed: Vec<Node>) -> Self {
        Self { error, completed }
    }
}

/// Outputs of the nodes built so far.
#[derive(Default)]
struct Outputs {
    address_space: Option<AddressSpace>,
    access: Option<AccessChain>,
    zone: Option<Zone>,
    certificate: Option<Certificate>,
    issued: Option<Certificate>,
    volume: Option<Volume>,
    cluster: Option<Cluster>,
    task: Option<TaskSpec>,
    service: Option<ServiceInstance>,
    load_balancer: Option<LoadBalancer>,
    dns_record: Option<DnsRecord>,
    tls_listener: Option<Listener>,
    admin_listener: Option<Listener>,
    tls_serving: Option<Listener>,
    admin_serving: Option<Listener>,
}

fn input<T>(slot: Option<T>, node: Node, dep: Node) -> common::Result<T> {
    slot.ok_or_else(|| {
        TopologyError::config(
            node.as_str(),
            format!("requires {dep}, which has not been built"),
        )
    })
}

/// Runs one build pass.
pub struct Builder<'a> {
    config: &'a Config,
    substrate: &'a dyn ComputeSubstrate,
    edge: &'a dyn LoadBalancerDirectory,
    dns: &'a dyn DnsProvider,
    ca: &'a dyn CertificateAuthority,
    cancel: CancellationToken,
}

impl<'a> Builder<'a> {
    pub fn new(
        config: &'a Config,
        substrate: &'a dyn ComputeSubstrate,
        edge: &'a dyn LoadBalancerDirectory,
        dns: &'a dyn DnsProvider,
        ca: &'a dyn CertificateAuthority,
    ) -> Self {
        Self {
            config,
            substrate,
            edge,
            dns,
            ca,
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon the build when `token` is cancelled. The certificate wait also
    /// cancels it when its bound elapses.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Validate the configuration, then execute the standard plan.
    pub async fn run(&self) -> Result<Deployment, BuildFailure> {
        self.config
            .validate()
            .map_err(|e| BuildFailure::new(e, Vec::new()))?;
        let plan = BuildPlan::standard().map_err(|e| BuildFailure::new(e, Vec::new()))?;
        self.execute(&plan).await
    }

    /// Execute `plan` node by node, stopping at the first error.
    pub async fn execute(&self, plan: &BuildPlan) -> Result<Deployment, BuildFailure> {
        let mut outputs = Outputs::default();
        let mut completed = Vec::with_capacity(plan.steps().len());

        for node in plan.order() {
            if self.cancel.is_cancelled() {
                let error = TopologyError::timeout(node.as_str(), "build abandoned before this step");
                return Err(BuildFailure::new(error, completed));
            }
            let span = info_span!("build_step", node = %node);
            if let Err(e) = self.step(node, &mut outputs).instrument(span).await {
                error!(node = %node, error = %e, code = e.code(), "build failed");
                return Err(BuildFailure::new(e, completed));
            }
            completed.push(node);
        }

        let deployment = self
            .assemble(plan, outputs)
            .map_err(|e| BuildFailure::new(e, completed))?;
        info!(
            resources = deployment.resource_ids().len(),
            dns_name = %deployment.load_balancer.dns_name,
            "build complete"
        );
        Ok(deployment)
    }

    async fn step(&self, node: Node, out: &mut Outputs) -> common::Result<()> {
        let cfg = self.config;
        match node {
            Node::AddressSpace => {
                out.address_space = Some(allocate(&cfg.region, &cfg.cidr, cfg.az_count, &cfg.subnet_specs())?);
            }
            Node::AccessChain => {
                input(out.address_space.as_ref(), node, Node::AddressSpace)?;
                out.access = Some(chain(&cfg.tiers()?)?);
            }
            Node::Zone => {
                out.zone = Some(naming::lookup_zone(self.dns, &cfg.domain_name).await?);
            }
            Node::Certificate => {
                let zone = input(out.zone.as_ref(), node, Node::Zone)?;
                out.certificate = Some(naming::request_certificate(self.ca, &cfg.fqdn(), zone).await?);
            }
            Node::CertificateIssued => {
                let zone = input(out.zone.as_ref(), node, Node::Zone)?;
                let pending = input(out.certificate.clone(), node, Node::Certificate)?;
                let issued =
                    naming::await_issued(self.ca, zone, pending, cfg.wait_policy(), &self.cancel).await?;
                out.issued = Some(issued);
            }
            Node::Volume => {
                let space = input(out.address_space.as_ref(), node, Node::AddressSpace)?;
                let access = input(out.access.as_ref(), node, Node::AccessChain)?;
                out.volume = Some(provision(
                    space,
                    access.require(SERVICE_TIER)?,
                    access.require(STORAGE_TIER)?,
                    &cfg.volume_spec()?,
                )?);
            }
            Node::Cluster => {
                let space = input(out.address_space.as_ref(), node, Node::AddressSpace)?;
                out.cluster = Some(compute::create_cluster(self.substrate, &cfg.cluster_name, space).await?);
            }
            Node::TaskSpec => {
                let volume = input(out.volume.as_ref(), node, Node::Volume)?;
                let request = cfg.task_request(volume);
                out.task = Some(compute::define_task(self.substrate, request, slice::from_ref(volume))?);
            }
            Node::ServiceInstance => {
                let cluster = input(out.cluster.as_ref(), node, Node::Cluster)?;
                let task = input(out.task.as_ref(), node, Node::TaskSpec)?;
                let space = input(out.address_space.as_ref(), node, Node::AddressSpace)?;
                let access = input(out.access.as_ref(), node, Node::AccessChain)?;
                let service = access.require(SERVICE_TIER)?;
                out.service = Some(
                    compute::place(self.substrate, cluster, task, SubnetTier::Private, space, service).await?,
                );
            }
            Node::LoadBalancer => {
                let space = input(out.address_space.as_ref(), node, Node::AddressSpace)?;
                let access = input(out.access.as_ref(), node, Node::AccessChain)?;
                out.load_balancer = Some(
                    edge::create_load_balancer(
                        self.edge,
                        &cfg.load_balancer_name,
                        space,
                        access.edge(),
                        SubnetTier::Public,
                    )
                    .await?,
                );
            }
            Node::DnsRecord => {
                let zone = input(out.zone.as_ref(), node, Node::Zone)?;
                let lb = input(out.load_balancer.as_ref(), node, Node::LoadBalancer)?;
                out.dns_record = Some(
                    naming::bind_name(self.dns, zone, &cfg.record_name, &lb.dns_name, cfg.dns_ttl_secs).await?,
                );
            }
            Node::TlsListener => {
                let issued = input(out.issued.as_ref(), node, Node::CertificateIssued)?;
                let lb = input(out.load_balancer.as_mut(), node, Node::LoadBalancer)?;
                out.tls_listener = Some(edge::add_listener(lb, cfg.tls_port, Protocol::Tls, Some(issued))?);
            }
            Node::AdminListener => {
                let lb = input(out.load_balancer.as_mut(), node, Node::LoadBalancer)?;
                out.admin_listener = Some(edge::add_listener(lb, cfg.admin_port, Protocol::Tcp, None)?);
            }
            Node::TlsTargets => {
                let listener = input(out.tls_listener.clone(), node, Node::TlsListener)?;
                let instance = input(out.service.as_ref(), node, Node::ServiceInstance)?;
                let access = input(out.access.as_ref(), node, Node::AccessChain)?;
                out.tls_serving = Some(edge::attach_targets(
                    listener,
                    cfg.app_port,
                    Protocol::Tcp,
                    slice::from_ref(instance),
                    access.require(SERVICE_TIER)?,
                )?);
            }
            Node::AdminTargets => {
                let listener = input(out.admin_listener.clone(), node, Node::AdminListener)?;
                let instance = input(out.service.as_ref(), node, Node::ServiceInstance)?;
                let access = input(out.access.as_ref(), node, Node::AccessChain)?;
                out.admin_serving = Some(edge::attach_targets(
                    listener,
                    cfg.admin_target_port,
                    Protocol::Tcp,
                    slice::from_ref(instance),
                    access.require(SERVICE_TIER)?,
                )?);
            }
        }
        Ok(())
    }

    fn assemble(&self, plan: &BuildPlan, out: Outputs) -> common::Result<Deployment> {
        let missing = |node: Node| TopologyError::config("build-plan", format!("plan never built {node}"));

        let mut deployment = Deployment {
            plan: plan.order(),
            address_space: out.address_space.ok_or_else(|| missing(Node::AddressSpace))?,
            access: out.access.ok_or_else(|| missing(Node::AccessChain))?,
            volume: out.volume.ok_or_else(|| missing(Node::Volume))?,
            cluster: out.cluster.ok_or_else(|| missing(Node::Cluster))?,
            task: out.task.ok_or_else(|| missing(Node::TaskSpec))?,
            service: out.service.ok_or_else(|| missing(Node::ServiceInstance))?,
            zone: out.zone.ok_or_else(|| missing(Node::Zone))?,
            certificate: out.issued.ok_or_else(|| missing(Node::CertificateIssued))?,
            load_balancer: out.load_balancer.ok_or_else(|| missing(Node::LoadBalancer))?,
            dns_record: out.dns_record.ok_or_else(|| missing(Node::DnsRecord))?,
            listeners: vec![
                out.tls_serving.ok_or_else(|| missing(Node::TlsTargets))?,
                out.admin_serving.ok_or_else(|| missing(Node::AdminTargets))?,
            ],
            tags: TagSet::new(),
        };
        deployment.tags = tags::decorate(&deployment, &self.config.tags);
        Ok(deployment)
    }
}
