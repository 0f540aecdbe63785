//! ID and timestamp utilities for protoflow
//!
//! Projects, protocol runs, step runs and events use SQLite rowids. Jobs and
//! workers get string identifiers so they can be logged before they are stored.

use chrono::Utc;
use rand::Rng;

/// Get current time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a job ID
///
/// Format: `job-{timestamp_ms}-{random_hex}`
/// Example: `job-1738300800123-a1b2c3d4`
pub fn generate_job_id() -> String {
    let random: u32 = rand::rng().random();
    format!("job-{}-{:08x}", now_ms(), random)
}

/// Generate a worker ID for a pool member
///
/// Format: `worker-{index}-{random_hex}`
pub fn generate_worker_id(index: usize) -> String {
    let random: u16 = rand::rng().random();
    format!("worker-{}-{:04x}", index, random)
}
