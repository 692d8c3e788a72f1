//! Passage - L4 edge proxy
//!
//! Terminates TCP (plain or behind a SOCKS5 handshake) and relays to
//! health-checked, weighted backend pools, with CIDR admission control and
//! live administration of connections and sessions.
//!
//! # Architecture
//!
//! ```text
//!                  +----------------+
//!                  |   command/     |  admin grammar
//!                  +-------+--------+
//!                          |
//!        +-----------------+------------------+
//!        |                 |                  |
//! +------v------+   +------v------+    +------v------+
//! |  listener/  |   |  security/  |    |  registry/  |
//! | (tcp/socks5)|   | (admission) |    | (conn/sess) |
//! +------+------+   +-------------+    +-------------+
//!        |
//! +------v------+   +-------------+
//! |  backend/   |   |  eventloop/ |
//! | (selection, |   | (reactors)  |
//! | healthcheck)|   +-------------+
//! +------+------+
//!        |
//! +------v------+
//! |  session/   |
//! |  (relay)    |
//! +-------------+
//! ```

pub mod backend;
pub mod cert;
pub mod command;
pub mod common;
pub mod config;
pub mod eventloop;
pub mod listener;
pub mod registry;
pub mod security;
pub mod session;

pub use common::error::{Error, Result};
pub use config::Config;

use backend::{HealthCheckConfig, Method, ServerGroup, ServerGroups};
use cert::CertKey;
use common::NamedSet;
use eventloop::EventLoopGroup;
use listener::{ListenerCore, ListenerKind, ProxyListener, Socks5Server, TcpLb};
use parking_lot::RwLock;
use registry::{ConnectionRegistry, Scope};
use security::{RuleAction, SecurityGroup};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub const VERSION: &str = "0.3.1";

/// Default event loop groups created at startup, matching the usual
/// acceptor/worker/control split.
pub const DEFAULT_ACCEPTOR_GROUP: &str = "(acceptor-elg)";
pub const DEFAULT_WORKER_GROUP: &str = "(worker-elg)";
pub const DEFAULT_CONTROL_GROUP: &str = "(control-elg)";

/// Common creation parameters shared by both listener variants.
pub struct ListenerParams {
    pub name: String,
    pub address: SocketAddr,
    pub backend: String,
    pub security_group: Option<String>,
    pub acceptor_group: Option<String>,
    pub worker_group: Option<String>,
    pub in_buffer_size: usize,
    pub out_buffer_size: usize,
}

/// Process-scoped holder of every administrative registry. Constructed
/// explicitly and passed by reference; there are no process-wide singletons.
pub struct App {
    registry: Arc<ConnectionRegistry>,
    default_security: Arc<SecurityGroup>,
    event_loop_groups: RwLock<NamedSet<Arc<EventLoopGroup>>>,
    server_groups: RwLock<NamedSet<Arc<ServerGroup>>>,
    backends: RwLock<NamedSet<Arc<ServerGroups>>>,
    security_groups: RwLock<NamedSet<Arc<SecurityGroup>>>,
    cert_keys: RwLock<NamedSet<Arc<CertKey>>>,
    listeners: RwLock<NamedSet<Arc<dyn ProxyListener>>>,
}

impl App {
    /// Build an empty application with the default event loop groups.
    pub fn new() -> Result<Arc<Self>> {
        let app = App {
            registry: Arc::new(ConnectionRegistry::new()),
            default_security: SecurityGroup::allow_all(),
            event_loop_groups: RwLock::new(NamedSet::new("event-loop-group")),
            server_groups: RwLock::new(NamedSet::new("server-group")),
            backends: RwLock::new(NamedSet::new("server-groups")),
            security_groups: RwLock::new(NamedSet::new("security-group")),
            cert_keys: RwLock::new(NamedSet::new("cert-key")),
            listeners: RwLock::new(NamedSet::new("listener")),
        };

        app.add_event_loop_group(DEFAULT_ACCEPTOR_GROUP)?;
        app.add_event_loop(DEFAULT_ACCEPTOR_GROUP, "acceptor")?;

        app.add_event_loop_group(DEFAULT_WORKER_GROUP)?;
        for i in 0..num_cpus::get().max(1) {
            app.add_event_loop(DEFAULT_WORKER_GROUP, &format!("worker{}", i))?;
        }

        app.add_event_loop_group(DEFAULT_CONTROL_GROUP)?;
        app.add_event_loop(DEFAULT_CONTROL_GROUP, "control")?;

        info!("application initialized (v{})", VERSION);
        Ok(Arc::new(app))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Apply one administrative command line.
    pub fn execute(&self, input: &str) -> Result<command::Response> {
        command::execute(self, input)
    }

    // ---- event loop groups -------------------------------------------------

    pub fn add_event_loop_group(&self, name: &str) -> Result<()> {
        self.event_loop_groups
            .write()
            .insert(name.to_string(), EventLoopGroup::new(name))
    }

    pub fn get_event_loop_group(&self, name: &str) -> Result<Arc<EventLoopGroup>> {
        self.event_loop_groups.read().require(name).map(Arc::clone)
    }

    pub fn event_loop_group_list(&self) -> Vec<Arc<EventLoopGroup>> {
        self.event_loop_groups.read().iter().cloned().collect()
    }

    pub fn remove_event_loop_group(&self, name: &str) -> Result<()> {
        if self
            .server_groups
            .read()
            .iter()
            .any(|g| g.event_loop_group().name() == name)
        {
            return Err(Error::invalid_argument(format!(
                "event-loop-group {} is used by a server-group",
                name
            )));
        }
        if self.listeners.read().iter().any(|l| {
            let info = l.info();
            info.acceptor_loop_group == name || info.worker_loop_group == name
        }) {
            return Err(Error::invalid_argument(format!(
                "event-loop-group {} is used by a listener",
                name
            )));
        }

        let group = self.event_loop_groups.write().remove(name)?;
        group.stop_all(&self.registry);
        Ok(())
    }

    pub fn add_event_loop(&self, group: &str, name: &str) -> Result<()> {
        self.get_event_loop_group(group)?.add_loop(name)?;
        Ok(())
    }

    pub fn remove_event_loop(&self, group: &str, name: &str) -> Result<()> {
        let elg = self.get_event_loop_group(group)?;
        let label = elg.get_loop(name)?.label().to_string();
        elg.remove_loop(name, &self.registry)?;

        // Timers and accept tasks that lived on the removed loop migrate to
        // the remaining ones.
        for sg in self.server_group_list() {
            if sg.event_loop_group().name() == group {
                if let Err(e) = sg.respawn_checks() {
                    warn!("server-group {}: probes stalled: {}", sg.name(), e);
                }
            }
        }
        for listener in self.listener_list(None) {
            if listener.core().acceptor_label().as_deref() == Some(label.as_str()) {
                if let Err(e) = listener::restart(listener.clone()) {
                    warn!(
                        "listener {} stopped accepting: {}",
                        listener.core().name(),
                        e
                    );
                }
            }
        }
        Ok(())
    }

    // ---- backend aggregates ------------------------------------------------

    pub fn add_server_groups(&self, name: &str) -> Result<()> {
        self.backends
            .write()
            .insert(name.to_string(), ServerGroups::new(name))
    }

    pub fn get_server_groups(&self, name: &str) -> Result<Arc<ServerGroups>> {
        self.backends.read().require(name).map(Arc::clone)
    }

    pub fn server_groups_list(&self) -> Vec<Arc<ServerGroups>> {
        self.backends.read().iter().cloned().collect()
    }

    pub fn remove_server_groups(&self, name: &str) -> Result<()> {
        if self
            .listeners
            .read()
            .iter()
            .any(|l| l.core().backend().name() == name)
        {
            return Err(Error::invalid_argument(format!(
                "server-groups {} is used by a listener",
                name
            )));
        }
        self.backends.write().remove(name)?;
        Ok(())
    }

    // ---- server groups -----------------------------------------------------

    pub fn add_server_group(
        &self,
        name: &str,
        check_config: HealthCheckConfig,
        method: Method,
        event_loop_group: Option<&str>,
    ) -> Result<()> {
        let elg =
            self.get_event_loop_group(event_loop_group.unwrap_or(DEFAULT_CONTROL_GROUP))?;
        self.server_groups.write().insert(
            name.to_string(),
            ServerGroup::new(name, check_config, method, elg),
        )
    }

    pub fn get_server_group(&self, name: &str) -> Result<Arc<ServerGroup>> {
        self.server_groups.read().require(name).map(Arc::clone)
    }

    pub fn server_group_list(&self) -> Vec<Arc<ServerGroup>> {
        self.server_groups.read().iter().cloned().collect()
    }

    pub fn update_server_group(
        &self,
        name: &str,
        check_config: Option<HealthCheckConfig>,
        method: Option<Method>,
    ) -> Result<()> {
        let group = self.get_server_group(name)?;
        if let Some(config) = check_config {
            group.update_check_config(config);
        }
        if let Some(method) = method {
            group.set_method(method);
        }
        Ok(())
    }

    pub fn remove_server_group(&self, name: &str) -> Result<()> {
        if self
            .backends
            .read()
            .iter()
            .any(|sgs| sgs.contains_group(name))
        {
            return Err(Error::invalid_argument(format!(
                "server-group {} is attached to a server-groups",
                name
            )));
        }
        let group = self.server_groups.write().remove(name)?;
        group.stop_checks();
        Ok(())
    }

    pub fn attach_server_group(&self, aggregate: &str, group: &str, weight: u32) -> Result<()> {
        let sgs = self.get_server_groups(aggregate)?;
        let sg = self.get_server_group(group)?;
        sgs.add_group(sg, weight)
    }

    pub fn detach_server_group(&self, aggregate: &str, group: &str) -> Result<()> {
        self.get_server_groups(aggregate)?.remove_group(group)
    }

    // ---- security groups ---------------------------------------------------

    pub fn add_security_group(&self, name: &str, default_action: RuleAction) -> Result<()> {
        if name == self.default_security.name() {
            return Err(Error::already_exists(format!("security-group {}", name)));
        }
        self.security_groups
            .write()
            .insert(name.to_string(), SecurityGroup::new(name, default_action))
    }

    /// `(allow-all)` resolves to the built-in group.
    pub fn get_security_group(&self, name: &str) -> Result<Arc<SecurityGroup>> {
        if name == self.default_security.name() {
            return Ok(self.default_security.clone());
        }
        self.security_groups.read().require(name).map(Arc::clone)
    }

    pub fn security_group_list(&self) -> Vec<Arc<SecurityGroup>> {
        self.security_groups.read().iter().cloned().collect()
    }

    pub fn remove_security_group(&self, name: &str) -> Result<()> {
        if self
            .listeners
            .read()
            .iter()
            .any(|l| l.core().security_group().name() == name)
        {
            return Err(Error::invalid_argument(format!(
                "security-group {} is used by a listener",
                name
            )));
        }
        self.security_groups.write().remove(name)?;
        Ok(())
    }

    // ---- cert keys ---------------------------------------------------------

    pub fn add_cert_key(&self, name: &str, certs: Vec<PathBuf>, key: PathBuf) -> Result<()> {
        let mut set = self.cert_keys.write();
        if set.contains(name) {
            return Err(Error::already_exists(format!("cert-key {}", name)));
        }
        let cert_key = CertKey::new(name, certs, key)?;
        set.insert(name.to_string(), Arc::new(cert_key))
    }

    pub fn get_cert_key(&self, name: &str) -> Result<Arc<CertKey>> {
        self.cert_keys.read().require(name).map(Arc::clone)
    }

    pub fn cert_key_list(&self) -> Vec<Arc<CertKey>> {
        self.cert_keys.read().iter().cloned().collect()
    }

    pub fn remove_cert_key(&self, name: &str) -> Result<()> {
        if self.listeners.read().iter().any(|l| {
            l.info()
                .cert_keys
                .map(|keys| keys.iter().any(|k| k == name))
                .unwrap_or(false)
        }) {
            return Err(Error::invalid_argument(format!(
                "cert-key {} is used by a listener",
                name
            )));
        }
        self.cert_keys.write().remove(name)?;
        Ok(())
    }

    // ---- listeners ---------------------------------------------------------

    fn build_core(&self, params: &ListenerParams) -> Result<ListenerCore> {
        if self.listeners.read().contains(&params.name) {
            return Err(Error::already_exists(format!("listener {}", params.name)));
        }
        let backend = self.get_server_groups(&params.backend)?;
        let security_group = match &params.security_group {
            Some(name) => self.get_security_group(name)?,
            None => self.default_security.clone(),
        };
        let acceptor = self.get_event_loop_group(
            params
                .acceptor_group
                .as_deref()
                .unwrap_or(DEFAULT_ACCEPTOR_GROUP),
        )?;
        let worker = self.get_event_loop_group(
            params
                .worker_group
                .as_deref()
                .unwrap_or(DEFAULT_WORKER_GROUP),
        )?;

        ListenerCore::bind(
            &params.name,
            params.address,
            backend,
            security_group,
            params.in_buffer_size,
            params.out_buffer_size,
            acceptor,
            worker,
            self.registry.clone(),
        )
    }

    fn install_listener(&self, name: &str, listener: Arc<dyn ProxyListener>) -> Result<()> {
        listener::start(listener.clone())?;
        match self.listeners.write().insert(name.to_string(), listener.clone()) {
            Ok(()) => Ok(()),
            Err(e) => {
                // lost a create race after starting the accept loop
                listener.core().stop();
                Err(e)
            }
        }
    }

    pub fn add_tcp_lb(
        &self,
        params: ListenerParams,
        protocol: String,
        cert_keys: Vec<String>,
    ) -> Result<()> {
        if protocol != "tcp" {
            return Err(Error::invalid_argument(format!(
                "unsupported tcp-lb protocol {}",
                protocol
            )));
        }
        for cert_key in &cert_keys {
            self.get_cert_key(cert_key)?;
        }
        let core = self.build_core(&params)?;
        self.install_listener(&params.name, TcpLb::new(core, protocol, cert_keys))
    }

    pub fn add_socks5_server(
        &self,
        params: ListenerParams,
        allow_non_backend: bool,
    ) -> Result<()> {
        let core = self.build_core(&params)?;
        self.install_listener(&params.name, Socks5Server::new(core, allow_non_backend))
    }

    pub fn get_listener(
        &self,
        name: &str,
        kind: Option<ListenerKind>,
    ) -> Result<Arc<dyn ProxyListener>> {
        let listener = self.listeners.read().require(name).map(Arc::clone)?;
        if let Some(kind) = kind {
            if listener.kind() != kind {
                return Err(Error::not_found(format!("{} {}", kind, name)));
            }
        }
        Ok(listener)
    }

    pub fn listener_list(&self, kind: Option<ListenerKind>) -> Vec<Arc<dyn ProxyListener>> {
        self.listeners
            .read()
            .iter()
            .filter(|l| kind.map(|k| l.kind() == k).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn update_listener(
        &self,
        name: &str,
        kind: ListenerKind,
        in_buffer_size: Option<usize>,
        out_buffer_size: Option<usize>,
        security_group: Option<&str>,
        allow_non_backend: Option<bool>,
    ) -> Result<()> {
        let listener = self.get_listener(name, Some(kind))?;
        // resolve references first so the update applies fully or not at all
        let security_group = match security_group {
            Some(name) => Some(self.get_security_group(name)?),
            None => None,
        };
        if allow_non_backend.is_some() && kind != ListenerKind::Socks5 {
            return Err(Error::invalid_argument(
                "allow-non-backend only applies to socks5-server",
            ));
        }

        let core = listener.core();
        core.set_buffer_sizes(
            in_buffer_size.unwrap_or_else(|| core.in_buffer_size()),
            out_buffer_size.unwrap_or_else(|| core.out_buffer_size()),
        );
        if let Some(group) = security_group {
            core.set_security_group(group);
        }
        if let Some(allow) = allow_non_backend {
            listener.set_allow_non_backend(allow)?;
        }
        Ok(())
    }

    pub fn remove_listener(&self, name: &str, kind: ListenerKind) -> Result<()> {
        // kind check before removal so `remove tcp-lb x` cannot take out a
        // socks5-server of the same name
        self.get_listener(name, Some(kind))?;
        let listener = self.listeners.write().remove(name)?;
        listener.core().stop();
        let closed = self.registry.close_listener(name);
        info!("{} {} removed ({} sessions closed)", kind, name, closed);
        Ok(())
    }

    // ---- scopes ------------------------------------------------------------

    /// Resolve a parsed scope chain against live entities.
    pub fn resolve_scope(&self, chain: &command::ScopeChain) -> Result<Scope> {
        match chain {
            command::ScopeChain::EventLoop { group, name } => {
                let elg = self.get_event_loop_group(group)?;
                let el = elg.get_loop(name)?;
                Ok(Scope::Loop(el.label().to_string()))
            }
            command::ScopeChain::Listener { entity, name } => {
                let kind = match entity {
                    command::Entity::TcpLb => ListenerKind::Tcp,
                    _ => ListenerKind::Socks5,
                };
                self.get_listener(name, Some(kind))?;
                Ok(Scope::Listener(name.clone()))
            }
            command::ScopeChain::Server { group, name } => {
                let sg = self.get_server_group(group)?;
                sg.get_server(name)?;
                Ok(Scope::Server(name.clone()))
            }
        }
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Stop accepting, close every connection, stop probers and reactors.
    pub fn shutdown(&self) {
        info!("shutting down");
        for listener in self.listener_list(None) {
            listener.core().stop();
        }
        let closed = self.registry.close_all();
        if closed > 0 {
            info!("closed {} connections", closed);
        }
        for group in self.server_group_list() {
            group.stop_checks();
        }
        for elg in self.event_loop_group_list() {
            elg.stop_all(&self.registry);
        }
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.3.1");
    }
}
