//! Human- and machine-readable summary of a build.

use anyhow::{Context, Result};
use clap::ValueEnum;
use common::Protocol;
use serde::Serialize;

use crate::access::Source;
use crate::edge::ListenerState;
use crate::naming::CertificateState;
use crate::network::SubnetTier;
use crate::plan::{Deployment, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Yaml,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubnetLine {
    pub id: String,
    pub tier: SubnetTier,
    pub zone: String,
    pub cidr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleLine {
    pub group: String,
    pub source: String,
    pub port: u16,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerLine {
    pub port: u16,
    pub protocol: Protocol,
    pub target_port: Option<u16>,
    pub state: ListenerState,
    pub generation: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub plan: Vec<Node>,
    pub cidr: String,
    pub subnets: Vec<SubnetLine>,
    pub rules: Vec<RuleLine>,
    pub volume_path: String,
    pub volume_owner: String,
    pub volume_mode: String,
    pub service: String,
    pub service_tier: SubnetTier,
    pub task_revision: String,
    pub load_balancer: String,
    pub listeners: Vec<ListenerLine>,
    pub record: String,
    pub certificate: String,
    pub certificate_state: CertificateState,
    pub resources: usize,
}

impl Report {
    pub fn new(d: &Deployment) -> Self {
        let subnets = d
            .address_space
            .subnets
            .iter()
            .map(|s| SubnetLine {
                id: s.id.to_string(),
                tier: s.tier,
                zone: s.availability_zone.clone(),
                cidr: s.cidr.to_string(),
            })
            .collect();
        let rules = d
            .access
            .groups()
            .iter()
            .flat_map(|g| {
                g.rules.iter().map(move |r| RuleLine {
                    group: g.id.to_string(),
                    source: match &r.source {
                        Source::Internet => "internet".to_string(),
                        other => other.to_string(),
                    },
                    port: r.port,
                    description: r.description.clone(),
                })
            })
            .collect();
        let listeners = d
            .listeners
            .iter()
            .map(|l| ListenerLine {
                port: l.port,
                protocol: l.protocol,
                target_port: l.mapping().map(|(_, target)| target),
                state: l.state,
                generation: l.generation,
            })
            .collect();

        Self {
            plan: d.plan.clone(),
            cidr: d.address_space.cidr.to_string(),
            subnets,
            rules,
            volume_path: d.volume.path().to_string(),
            volume_owner: d.volume.owner().to_string(),
            volume_mode: d.volume.mode().to_string(),
            service: d.service.id.to_string(),
            service_tier: d.service.tier,
            task_revision: d.task.revision.clone(),
            load_balancer: d.load_balancer.dns_name.clone(),
            listeners,
            record: format!("{} CNAME {}", d.dns_record.name, d.dns_record.target),
            certificate: d.certificate.domain_name.clone(),
            certificate_state: d.certificate.state,
            resources: d.resource_ids().len(),
        }
    }

    pub fn render(&self, format: Format) -> Result<String> {
        match format {
            Format::Json => serde_json::to_string_pretty(self).context("failed to render JSON report"),
            Format::Yaml => serde_yaml::to_string(self).context("failed to render YAML report"),
        }
    }
}
