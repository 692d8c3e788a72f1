//! Backend pools: servers, health checking, and selection

pub mod group;
pub mod groups;
pub mod healthcheck;
pub mod method;
pub mod server;

pub use group::ServerGroup;
pub use groups::ServerGroups;
pub use healthcheck::{HealthCheckConfig, HealthChecker, HealthState};
pub use method::Method;
pub use server::Server;
