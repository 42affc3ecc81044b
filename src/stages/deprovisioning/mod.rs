//! Deprovisioning stages.

mod wait_for_cluster_deletion;

pub use wait_for_cluster_deletion::{WaitForClusterDeletionStep, POLL_DELAY};
