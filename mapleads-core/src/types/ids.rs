use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Namespace for deterministic task ids (UUIDv5 over `job_id/task_key`).
const TASK_NAMESPACE: Uuid = Uuid::from_u128(0x6d61_706c_6561_6473_7461_736b_0000_0001);

/// Unique identifier for scrape jobs.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a search task. Derived from the owning job and the task key
/// so decomposition is reproducible for a given job.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn derive(job_id: JobId, task_key: &str) -> Self {
        let name = format!("{}/{}", job_id.0, task_key);
        Self(Uuid::new_v5(&TASK_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LeadId(pub Uuid);

impl Default for LeadId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeadId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proxy endpoints are identified by their address (`host:port` or URL).
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ProxyId(pub String);

impl ProxyId {
    pub const DIRECT: &'static str = "direct";

    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn direct() -> Self {
        Self(Self::DIRECT.to_string())
    }

    pub fn is_direct(&self) -> bool {
        self.0 == Self::DIRECT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Worker slot within a job's pool, e.g. `3f2a...#1`.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(job_id: JobId, slot: usize) -> Self {
        Self(format!("{}#{}", job_id, slot))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
