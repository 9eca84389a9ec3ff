//! Build-time compiler for one secure deployment shape: a two-tier network, an
//! edge → service → storage permission chain, a shared volume, a private
//! serverless service, and a TLS load balancer with its DNS name and certificate.
//!
//! [`plan::Builder`] runs the whole pass in dependency order.

pub mod access;
pub mod aws;
pub mod compute;
pub mod config;
pub mod edge;
pub mod naming;
pub mod network;
pub mod plan;
pub mod report;
pub mod storage;
pub mod tags;
pub mod telemetry;

#[cfg(test)]
mod testing;
