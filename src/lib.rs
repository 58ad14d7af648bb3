//! Stackwright: typed AWS stack composition, synthesized to CloudFormation.
//!
//! An app file declares stacks (an EC2 service, an EC2 service with an
//! in-place CodeDeploy pipeline, or a Fargate service with a blue/green
//! pipeline). Stackwright assembles each into a graph of typed constructs,
//! checks its structural invariants and renders deterministic templates.

pub mod cli;
pub mod core;
pub mod error;
pub mod resources;

pub use error::{Error, Result};
