//! Network protocols and well-known ports shared by every topology tier.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Well-known ports
// ---------------------------------------------------------------------------

/// Public HTTPS port terminated at the load balancer.
pub const HTTPS_PORT: u16 = 443;

/// Public SSH port forwarded to the service.
pub const SSH_PORT: u16 = 22;

/// NFSv4 port used by the shared filesystem.
pub const NFS_PORT: u16 = 2049;

/// Unprivileged container port receiving decrypted application traffic.
pub const APP_TARGET_PORT: u16 = 6610;

/// Unprivileged container port receiving forwarded SSH traffic.
pub const SSH_TARGET_PORT: u16 = 6611;

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Protocol spoken on a listener, target, or permission rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain TCP passthrough.
    Tcp,
    /// TCP with TLS terminated at the load balancer.
    Tls,
}

impl Protocol {
    /// Whether a listener on this protocol must carry a certificate.
    pub fn requires_certificate(self) -> bool {
        matches!(self, Protocol::Tls)
    }

    /// The transport-layer protocol a permission rule must open for this protocol.
    pub fn transport(self) -> Protocol {
        Protocol::Tcp
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Tls => f.write_str("TLS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_tls_requires_certificate() {
        assert!(Protocol::Tls.requires_certificate());
        assert!(!Protocol::Tcp.requires_certificate());
    }

    #[test]
    fn tls_rides_on_tcp() {
        assert_eq!(Protocol::Tls.transport(), Protocol::Tcp);
    }

    #[test]
    fn serde_lowercase() {
        assert_eq!(serde_json::to_string(&Protocol::Tls).unwrap(), "\"tls\"");
        let p: Protocol = serde_json::from_str("\"tcp\"").unwrap();
        assert_eq!(p, Protocol::Tcp);
    }

    #[test]
    fn well_known_ports_are_remapped_to_unprivileged() {
        assert!(APP_TARGET_PORT > 1024);
        assert!(SSH_TARGET_PORT > 1024);
        assert_ne!(HTTPS_PORT, APP_TARGET_PORT);
        assert_ne!(SSH_PORT, SSH_TARGET_PORT);
    }
}
