//! Core domain types for runflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Run, sample and job identifiers
//! - The job state machine
//! - Resource classes and cluster resource requests

mod identity;
mod resource;
mod status;

pub use identity::{JobId, RunId};
pub use resource::{ResourceClass, ResourceRequest};
pub use status::JobState;
