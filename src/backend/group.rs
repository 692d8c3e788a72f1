//! Server groups - weighted, health-checked backend pools

use super::healthcheck::{config_handle, HealthChecker, HealthCheckConfig, HealthConfigHandle};
use super::method::{self, Method, WrrState};
use super::server::Server;
use crate::eventloop::EventLoopGroup;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::info;

fn key_bytes(key: IpAddr) -> Vec<u8> {
    match key {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

/// A named pool of backend servers with one load balancing method and one
/// health check policy. Health check timers run on the group's event loop
/// group, decoupled from any listener's data-path loops.
pub struct ServerGroup {
    name: String,
    event_loop_group: Arc<EventLoopGroup>,
    method: RwLock<Method>,
    check_config: HealthConfigHandle,
    servers: RwLock<Arc<Vec<Arc<Server>>>>,
    wrr: Mutex<WrrState>,
}

impl ServerGroup {
    pub fn new(
        name: &str,
        check_config: HealthCheckConfig,
        method: Method,
        event_loop_group: Arc<EventLoopGroup>,
    ) -> Arc<Self> {
        Arc::new(ServerGroup {
            name: name.to_string(),
            event_loop_group,
            method: RwLock::new(method),
            check_config: config_handle(check_config),
            servers: RwLock::new(Arc::new(Vec::new())),
            wrr: Mutex::new(WrrState::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_loop_group(&self) -> &Arc<EventLoopGroup> {
        &self.event_loop_group
    }

    pub fn method(&self) -> Method {
        *self.method.read()
    }

    pub fn set_method(&self, method: Method) {
        *self.method.write() = method;
    }

    pub fn check_config(&self) -> Arc<HealthCheckConfig> {
        self.check_config.read().clone()
    }

    /// Swap the whole {timeout, period, up, down} group at once. Probers
    /// pick the new values up on their next tick.
    pub fn update_check_config(&self, config: HealthCheckConfig) {
        *self.check_config.write() = Arc::new(config);
    }

    fn spawn_check(&self, server: &Arc<Server>) -> Result<()> {
        let probe_loop = self.event_loop_group.next_loop()?;
        let checker = HealthChecker::new(
            server.clone(),
            self.check_config.clone(),
            server.renew_check(),
        );
        probe_loop.spawn(checker.run());
        Ok(())
    }

    /// Add a server, DOWN until its first `up` streak of probes completes.
    pub fn add_server(&self, name: &str, address: SocketAddr, weight: u32) -> Result<Arc<Server>> {
        let mut servers = self.servers.write();
        if servers.iter().any(|s| s.name() == name) {
            return Err(Error::already_exists(format!("server {}", name)));
        }

        // Spawn the prober before mutating, so a group without loops fails
        // cleanly and leaves the server list untouched.
        let server = Arc::new(Server::new(name, address, weight));
        self.spawn_check(&server)?;

        let mut next = servers.as_ref().clone();
        next.push(server.clone());
        *servers = Arc::new(next);

        info!(
            "server {} ({}) added to group {} with weight {}",
            name, address, self.name, weight
        );
        Ok(server)
    }

    /// Retire every prober and start fresh ones on the group's current
    /// loops. Called after an event loop leaves the group.
    pub fn respawn_checks(&self) -> Result<()> {
        let servers = self.servers.read().clone();
        for server in servers.iter() {
            self.spawn_check(server)?;
        }
        Ok(())
    }

    /// Remove a server. In-flight sessions to it are left alone; only new
    /// selection excludes it.
    pub fn remove_server(&self, name: &str) -> Result<()> {
        let mut servers = self.servers.write();
        let idx = servers
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| Error::not_found(format!("server {}", name)))?;

        let mut next = servers.as_ref().clone();
        let server = next.remove(idx);
        *servers = Arc::new(next);
        server.stop_check();

        info!("server {} removed from group {}", name, self.name);
        Ok(())
    }

    pub fn get_server(&self, name: &str) -> Result<Arc<Server>> {
        self.servers
            .read()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("server {}", name)))
    }

    /// Servers in insertion order.
    pub fn servers(&self) -> Arc<Vec<Arc<Server>>> {
        self.servers.read().clone()
    }

    /// Whether any server is currently UP with positive weight.
    pub fn has_up(&self) -> bool {
        self.servers
            .read()
            .iter()
            .any(|s| s.is_up() && s.weight() > 0)
    }

    /// Find a server by its backend address.
    pub fn find_by_address(&self, address: SocketAddr) -> Option<Arc<Server>> {
        self.servers
            .read()
            .iter()
            .find(|s| s.address() == address)
            .cloned()
    }

    /// Pick an UP server for `key` using the group's method.
    pub fn select_server(&self, key: IpAddr) -> Result<Arc<Server>> {
        let servers = self.servers.read().clone();
        let candidates: Vec<&Arc<Server>> = servers
            .iter()
            .filter(|s| s.is_up() && s.weight() > 0)
            .collect();
        if candidates.is_empty() {
            return Err(Error::no_healthy_server(format!(
                "server-group {}",
                self.name
            )));
        }

        let idx = match self.method() {
            Method::Wrr => {
                let items: Vec<(&str, u32)> = candidates
                    .iter()
                    .map(|s| (s.name(), s.weight()))
                    .collect();
                let mut state = self.wrr.lock();
                method::smooth_wrr(&mut state, &items)
            }
            Method::Wlc => {
                let items: Vec<(u64, u32)> = candidates
                    .iter()
                    .map(|s| (s.active_sessions(), s.weight()))
                    .collect();
                method::weighted_least_connection(&items)
            }
            Method::Source => {
                let weights: Vec<u32> = candidates.iter().map(|s| s.weight()).collect();
                method::source_hash(&key_bytes(key), &weights)
            }
        }
        .ok_or_else(|| Error::no_healthy_server(format!("server-group {}", self.name)))?;

        Ok(candidates[idx].clone())
    }

    /// Cancel every server's prober; used on group removal and shutdown.
    pub fn stop_checks(&self) {
        for server in self.servers.read().iter() {
            server.stop_check();
        }
    }
}
