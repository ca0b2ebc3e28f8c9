//! eksforge-operator provisions EKS clusters, control planes and node
//! groups by driving an external module executor through `ApplyRequest`
//! objects, and manages node-group replicas through machine sets and
//! machine deployments.

pub mod compiler;
pub mod controller;
pub mod crd;
pub mod error;
pub mod helpers;
pub mod store;
