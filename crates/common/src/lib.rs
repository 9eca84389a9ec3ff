//! Common identities, protocol definitions, and errors shared across `stack-compiler` crates.

pub mod error;
pub mod id;
pub mod protocol;

pub use error::{Result, TopologyError};
pub use id::ResourceId;
pub use protocol::Protocol;
