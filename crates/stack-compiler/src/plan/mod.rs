//! The explicit build plan.
//!
//! Nodes are the entities of a deployment and edges mean "requires". The order
//! is a topological sort that breaks ties by declaration order, so the same
//! declarations always yield the same order.

pub mod build;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use common::{Result, TopologyError};
use serde::Serialize;

pub use build::{BuildFailure, Builder, Deployment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    AddressSpace,
    AccessChain,
    Volume,
    TaskSpec,
    Zone,
    LoadBalancer,
    Certificate,
    CertificateIssued,
    Cluster,
    ServiceInstance,
    DnsRecord,
    TlsListener,
    AdminListener,
    TlsTargets,
    AdminTargets,
}

impl Node {
    pub fn as_str(self) -> &'static str {
        match self {
            Node::AddressSpace => "address_space",
            Node::AccessChain => "access_chain",
            Node::Volume => "volume",
            Node::TaskSpec => "task_spec",
            Node::Zone => "zone",
            Node::LoadBalancer => "load_balancer",
            Node::Certificate => "certificate",
            Node::CertificateIssued => "certificate_issued",
            Node::Cluster => "cluster",
            Node::ServiceInstance => "service_instance",
            Node::DnsRecord => "dns_record",
            Node::TlsListener => "tls_listener",
            Node::AdminListener => "admin_listener",
            Node::TlsTargets => "tls_targets",
            Node::AdminTargets => "admin_targets",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one deployment shape: every node with what it requires.
///
/// Nodes that need no collaborator come first, and the first lookups require
/// [`Node::TaskSpec`], so a statically detectable error surfaces before anything
/// external is contacted. The certificate wait precedes the cluster, the DNS
/// write and every listener, so a wait that times out leaves nothing created.
pub const STANDARD: &[(Node, &[Node])] = &[
    (Node::AddressSpace, &[]),
    (Node::AccessChain, &[Node::AddressSpace]),
    (Node::Volume, &[Node::AddressSpace, Node::AccessChain]),
    (Node::TaskSpec, &[Node::Volume]),
    (Node::Zone, &[Node::TaskSpec]),
    (Node::LoadBalancer, &[Node::AddressSpace, Node::AccessChain, Node::TaskSpec]),
    (Node::Certificate, &[Node::Zone]),
    (Node::CertificateIssued, &[Node::Certificate]),
    (Node::Cluster, &[Node::AddressSpace, Node::CertificateIssued]),
    (
        Node::ServiceInstance,
        &[Node::Cluster, Node::TaskSpec, Node::AddressSpace, Node::AccessChain],
    ),
    (Node::DnsRecord, &[Node::Zone, Node::LoadBalancer, Node::CertificateIssued]),
    (Node::TlsListener, &[Node::LoadBalancer, Node::CertificateIssued]),
    (Node::AdminListener, &[Node::LoadBalancer]),
    (Node::TlsTargets, &[Node::TlsListener, Node::ServiceInstance]),
    (Node::AdminTargets, &[Node::AdminListener, Node::ServiceInstance]),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub node: Node,
    pub requires: Vec<Node>,
}

/// A validated, ordered build plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    steps: Vec<Step>,
}

impl BuildPlan {
    pub fn standard() -> Result<Self> {
        Self::from_declarations(STANDARD)
    }

    /// Order `declarations` with Kahn's algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Config`] for a duplicate node, a requirement on an
    /// undeclared node, or a cycle (naming the nodes left unordered).
    pub fn from_declarations(declarations: &[(Node, &[Node])]) -> Result<Self> {
        let mut index = HashMap::with_capacity(declarations.len());
        for (i, (node, _)) in declarations.iter().enumerate() {
            if index.insert(*node, i).is_some() {
                return Err(TopologyError::config(node.as_str(), "declared twice in build plan"));
            }
        }

        let mut in_degree = vec![0usize; declarations.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); declarations.len()];
        for (i, (node, requires)) in declarations.iter().enumerate() {
            for dep in requires.iter() {
                let j = *index.get(dep).ok_or_else(|| {
                    TopologyError::config(node.as_str(), format!("requires undeclared node {dep}"))
                })?;
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..declarations.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut steps = Vec::with_capacity(declarations.len());
        while let Some(i) = ready.pop_first() {
            let (node, requires) = declarations[i];
            steps.push(Step {
                node,
                requires: requires.to_vec(),
            });
            for &k in &dependents[i] {
                in_degree[k] -= 1;
                if in_degree[k] == 0 {
                    ready.insert(k);
                }
            }
        }

        if steps.len() != declarations.len() {
            let stuck: Vec<&str> = declarations
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, (node, _))| node.as_str())
                .collect();
            return Err(TopologyError::config(
                "build-plan",
                format!("dependency cycle through {}", stuck.join(", ")),
            ));
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn order(&self) -> Vec<Node> {
        self.steps.iter().map(|s| s.node).collect()
    }

    pub fn position(&self, node: Node) -> Option<usize> {
        self.steps.iter().position(|s| s.node == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_order_respects_every_edge() {
        let plan = BuildPlan::standard().unwrap();
        assert_eq!(plan.steps().len(), STANDARD.len());
        for step in plan.steps() {
            for dep in &step.requires {
                assert!(plan.position(*dep) < plan.position(step.node), "{dep} after {}", step.node);
            }
        }
    }

    #[test]
    fn certificate_is_issued_before_any_listener() {
        let plan = BuildPlan::standard().unwrap();
        let issued = plan.position(Node::CertificateIssued).unwrap();
        assert!(issued < plan.position(Node::TlsListener).unwrap());
        assert!(issued < plan.position(Node::AdminListener).unwrap());
        assert!(plan.position(Node::ServiceInstance) < plan.position(Node::TlsTargets));
    }

    #[test]
    fn order_is_deterministic() {
        let a = BuildPlan::standard().unwrap().order();
        let b = BuildPlan::standard().unwrap().order();
        assert_eq!(a, b);
        assert_eq!(a[0], Node::AddressSpace);
        assert_eq!(a[1], Node::AccessChain);
        assert_eq!(a[2], Node::Volume);
        let declared: Vec<Node> = STANDARD.iter().map(|(node, _)| *node).collect();
        assert_eq!(a, declared);
    }

    #[test]
    fn offline_checks_precede_every_collaborator() {
        let plan = BuildPlan::standard().unwrap();
        let task = plan.position(Node::TaskSpec).unwrap();
        for node in [
            Node::Zone,
            Node::LoadBalancer,
            Node::Certificate,
            Node::CertificateIssued,
            Node::Cluster,
            Node::ServiceInstance,
            Node::DnsRecord,
        ] {
            assert!(plan.position(node).unwrap() > task, "{node} before task_spec");
        }
        let issued = plan.position(Node::CertificateIssued).unwrap();
        assert!(plan.position(Node::DnsRecord).unwrap() > issued);
    }

    #[test]
    fn cycles_are_config_errors() {
        let decls: &[(Node, &[Node])] = &[
            (Node::Zone, &[Node::DnsRecord]),
            (Node::DnsRecord, &[Node::Zone]),
            (Node::AddressSpace, &[]),
        ];
        let err = BuildPlan::from_declarations(decls).unwrap_err();
        assert!(matches!(err, TopologyError::Config { .. }));
        assert!(err.to_string().contains("zone, dns_record"));
    }

    #[test]
    fn undeclared_and_duplicate_nodes_rejected() {
        let missing: &[(Node, &[Node])] = &[(Node::Certificate, &[Node::Zone])];
        assert!(BuildPlan::from_declarations(missing).is_err());

        let dup: &[(Node, &[Node])] = &[(Node::Zone, &[]), (Node::Zone, &[])];
        assert!(BuildPlan::from_declarations(dup).is_err());
    }
}
