//! Concrete pipeline stages.

pub mod deprovisioning;
