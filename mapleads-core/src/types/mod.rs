pub mod ids;

pub use ids::{JobId, LeadId, ProxyId, TaskId, WorkerId};
