#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod manager;
mod policy;

pub use manager::{HealthManager, ProbeAction, ProbeOutcome};
pub use policy::HealthPolicy;
