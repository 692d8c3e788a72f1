//! Command execution against the application state
//!
//! Thin translation from parsed commands onto the App facade. Mutations
//! validate every reference before touching anything, so a failing command
//! leaves the topology as it was. Query actions return projections; how
//! they are rendered on the wire is the front end's business.

use super::parser::{
    self, Action, AdminCommand, Entity, EntityCommand, ForceRemoveCommand, ForceRemoveKind,
    ScopeChain, FLAG_ALLOW_NON_BACKEND, FLAG_DENY_NON_BACKEND,
};
use crate::backend::{HealthCheckConfig, Method, Server, ServerGroup};
use crate::common::net::parse_socket_addr;
use crate::listener::{ListenerKind, DEFAULT_BUFFER_SIZE};
use crate::security::{Protocol, RuleAction, SecurityGroup, SecurityGroupRule};
use crate::{App, Error, ListenerParams, Result};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Outcome of one administrative command.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Mutation applied.
    Done,
    /// Forced removal count (0 is a valid pattern-removal outcome).
    Removed(usize),
    /// Query projection.
    List(Vec<Value>),
}

/// Parse and execute one command line.
pub fn execute(app: &App, input: &str) -> Result<Response> {
    execute_parsed(app, parser::parse(input)?)
}

pub fn execute_parsed(app: &App, cmd: AdminCommand) -> Result<Response> {
    match cmd {
        AdminCommand::Entity(cmd) => execute_entity(app, cmd),
        AdminCommand::ForceRemove(cmd) => execute_force_remove(app, cmd),
    }
}

fn execute_entity(app: &App, cmd: EntityCommand) -> Result<Response> {
    match cmd.entity {
        Entity::EventLoopGroup => event_loop_group(app, cmd),
        Entity::EventLoop => event_loop(app, cmd),
        Entity::ServerGroups => server_groups(app, cmd),
        Entity::ServerGroup => server_group(app, cmd),
        Entity::Server => server(app, cmd),
        Entity::SecurityGroup => security_group(app, cmd),
        Entity::SecurityGroupRule => security_group_rule(app, cmd),
        Entity::TcpLb => listener(app, cmd, ListenerKind::Tcp),
        Entity::Socks5Server => listener(app, cmd, ListenerKind::Socks5),
        Entity::CertKey => cert_key(app, cmd),
        Entity::Connection => connections(app, cmd),
        Entity::Session => sessions(app, cmd),
    }
}

fn not_updatable(entity: Entity) -> Error {
    Error::invalid_argument(format!("{} cannot be updated", entity))
}

fn arg_u64(cmd: &EntityCommand, key: &str) -> Result<u64> {
    let v = cmd.require_arg(key)?;
    v.parse()
        .map_err(|_| Error::invalid_argument(format!("bad {} {}", key, v)))
}

/// The four health check fields come and go together.
fn health_config(cmd: &EntityCommand) -> Result<Option<HealthCheckConfig>> {
    let present = ["timeout", "period", "up", "down"]
        .iter()
        .filter(|k| cmd.arg(**k).is_some())
        .count();
    match present {
        0 => Ok(None),
        4 => {
            let timeout = arg_u64(cmd, "timeout")?;
            let period = arg_u64(cmd, "period")?;
            let up = arg_u64(cmd, "up")? as u32;
            let down = arg_u64(cmd, "down")? as u32;
            Ok(Some(HealthCheckConfig::new(timeout, period, up, down)?))
        }
        _ => Err(Error::invalid_argument(
            "timeout, period, up and down must be given together",
        )),
    }
}

fn method_arg(cmd: &EntityCommand) -> Result<Option<Method>> {
    cmd.arg("method").map(Method::try_from).transpose()
}

fn names(items: impl IntoIterator<Item = String>) -> Response {
    Response::List(items.into_iter().map(Value::String).collect())
}

// ---- event loops -----------------------------------------------------------

fn event_loop_group(app: &App, cmd: EntityCommand) -> Result<Response> {
    match cmd.action {
        Action::Add => {
            cmd.no_parent()?;
            app.add_event_loop_group(cmd.require_name()?)?;
            Ok(Response::Done)
        }
        Action::Remove => {
            app.remove_event_loop_group(cmd.require_name()?)?;
            Ok(Response::Done)
        }
        Action::Update => Err(not_updatable(cmd.entity)),
        Action::List => Ok(names(
            app.event_loop_group_list().iter().map(|g| g.name().to_string()),
        )),
        Action::ListDetail => Ok(Response::List(
            app.event_loop_group_list()
                .iter()
                .map(|g| json!({ "name": g.name(), "eventLoops": g.loop_names() }))
                .collect(),
        )),
    }
}

fn event_loop(app: &App, cmd: EntityCommand) -> Result<Response> {
    match cmd.action {
        Action::Add => {
            let group = cmd.require_parent(Entity::EventLoopGroup)?;
            app.add_event_loop(group, cmd.require_name()?)?;
            Ok(Response::Done)
        }
        Action::Remove => {
            let group = cmd.require_parent(Entity::EventLoopGroup)?;
            app.remove_event_loop(group, cmd.require_name()?)?;
            Ok(Response::Done)
        }
        Action::Update => Err(not_updatable(cmd.entity)),
        Action::List => {
            let group = cmd.require_parent(Entity::EventLoopGroup)?;
            Ok(names(app.get_event_loop_group(group)?.loop_names()))
        }
        Action::ListDetail => {
            let group = cmd.require_parent(Entity::EventLoopGroup)?;
            let elg = app.get_event_loop_group(group)?;
            Ok(Response::List(
                elg.list()
                    .iter()
                    .map(|el| {
                        let scope =
                            crate::registry::Scope::Loop(el.label().to_string());
                        json!({
                            "name": el.name(),
                            "connections": app.registry().list_connections(&scope).len(),
                        })
                    })
                    .collect(),
            ))
        }
    }
}

// ---- backends --------------------------------------------------------------

fn server_groups(app: &App, cmd: EntityCommand) -> Result<Response> {
    match cmd.action {
        Action::Add => {
            cmd.no_parent()?;
            app.add_server_groups(cmd.require_name()?)?;
            Ok(Response::Done)
        }
        Action::Remove => {
            app.remove_server_groups(cmd.require_name()?)?;
            Ok(Response::Done)
        }
        Action::Update => Err(not_updatable(cmd.entity)),
        Action::List => Ok(names(
            app.server_groups_list().iter().map(|s| s.name().to_string()),
        )),
        Action::ListDetail => Ok(Response::List(
            app.server_groups_list()
                .iter()
                .map(|sgs| {
                    let members: Vec<Value> = sgs
                        .members()
                        .iter()
                        .map(|(g, w)| json!({ "name": g.name(), "weight": w }))
                        .collect();
                    json!({ "name": sgs.name(), "serverGroups": members })
                })
                .collect(),
        )),
    }
}

fn server_group(app: &App, cmd: EntityCommand) -> Result<Response> {
    match cmd.action {
        Action::Add => {
            if cmd.parent.is_empty() {
                let config = health_config(&cmd)?.ok_or_else(|| {
                    Error::invalid_argument("timeout, period, up and down are required")
                })?;
                let method = method_arg(&cmd)?.unwrap_or_default();
                app.add_server_group(
                    cmd.require_name()?,
                    config,
                    method,
                    cmd.arg("event-loop-group"),
                )?;
            } else {
                let aggregate = cmd.require_parent(Entity::ServerGroups)?;
                let weight = cmd.arg_u32("weight", 10)?;
                app.attach_server_group(aggregate, cmd.require_name()?, weight)?;
            }
            Ok(Response::Done)
        }
        Action::Update => {
            if cmd.parent.is_empty() {
                app.update_server_group(
                    cmd.require_name()?,
                    health_config(&cmd)?,
                    method_arg(&cmd)?,
                )?;
            } else {
                let aggregate = cmd.require_parent(Entity::ServerGroups)?;
                let weight = cmd.arg_u32("weight", 10)?;
                app.get_server_groups(aggregate)?
                    .set_group_weight(cmd.require_name()?, weight)?;
            }
            Ok(Response::Done)
        }
        Action::Remove => {
            if cmd.parent.is_empty() {
                app.remove_server_group(cmd.require_name()?)?;
            } else {
                let aggregate = cmd.require_parent(Entity::ServerGroups)?;
                app.detach_server_group(aggregate, cmd.require_name()?)?;
            }
            Ok(Response::Done)
        }
        Action::List => {
            if cmd.parent.is_empty() {
                Ok(names(
                    app.server_group_list().iter().map(|g| g.name().to_string()),
                ))
            } else {
                let aggregate = cmd.require_parent(Entity::ServerGroups)?;
                Ok(names(
                    app.get_server_groups(aggregate)?
                        .members()
                        .iter()
                        .map(|(g, _)| g.name().to_string()),
                ))
            }
        }
        Action::ListDetail => {
            if cmd.parent.is_empty() {
                Ok(Response::List(
                    app.server_group_list()
                        .iter()
                        .map(|g| server_group_detail(g))
                        .collect(),
                ))
            } else {
                let aggregate = cmd.require_parent(Entity::ServerGroups)?;
                Ok(Response::List(
                    app.get_server_groups(aggregate)?
                        .members()
                        .iter()
                        .map(|(g, w)| {
                            let mut detail = server_group_detail(g);
                            detail["weight"] = json!(w);
                            detail
                        })
                        .collect(),
                ))
            }
        }
    }
}

fn server(app: &App, cmd: EntityCommand) -> Result<Response> {
    let group = cmd.require_parent(Entity::ServerGroup)?;
    let group = app.get_server_group(group)?;
    match cmd.action {
        Action::Add => {
            let address = parse_socket_addr(cmd.require_arg("address")?)?;
            let weight = cmd.arg_u32("weight", 10)?;
            group.add_server(cmd.require_name()?, address, weight)?;
            Ok(Response::Done)
        }
        Action::Update => {
            let weight = cmd.arg_u32("weight", 10)?;
            group.get_server(cmd.require_name()?)?.set_weight(weight);
            Ok(Response::Done)
        }
        Action::Remove => {
            group.remove_server(cmd.require_name()?)?;
            Ok(Response::Done)
        }
        Action::List => Ok(names(
            group.servers().iter().map(|s| s.name().to_string()),
        )),
        Action::ListDetail => Ok(Response::List(
            group.servers().iter().map(|s| server_value(s)).collect(),
        )),
    }
}

// ---- admission control -----------------------------------------------------

fn security_group(app: &App, cmd: EntityCommand) -> Result<Response> {
    match cmd.action {
        Action::Add => {
            cmd.no_parent()?;
            let action = RuleAction::try_from(cmd.require_arg("default")?)?;
            app.add_security_group(cmd.require_name()?, action)?;
            Ok(Response::Done)
        }
        Action::Update => {
            let name = cmd.require_name()?;
            let action = RuleAction::try_from(cmd.require_arg("default")?)?;
            // the built-in (allow-all) group is not administrable
            let group = app
                .security_group_list()
                .into_iter()
                .find(|g| g.name() == name)
                .ok_or_else(|| Error::not_found(format!("security-group {}", name)))?;
            group.set_default_action(action);
            Ok(Response::Done)
        }
        Action::Remove => {
            app.remove_security_group(cmd.require_name()?)?;
            Ok(Response::Done)
        }
        Action::List => Ok(names(
            app.security_group_list().iter().map(|g| g.name().to_string()),
        )),
        Action::ListDetail => Ok(Response::List(
            app.security_group_list()
                .iter()
                .map(|g| security_group_detail(g))
                .collect(),
        )),
    }
}

fn security_group_rule(app: &App, cmd: EntityCommand) -> Result<Response> {
    let group_name = cmd.require_parent(Entity::SecurityGroup)?;
    // rules only live on administrable groups, not the built-in one
    let group = app
        .security_group_list()
        .into_iter()
        .find(|g| g.name() == group_name)
        .ok_or_else(|| Error::not_found(format!("security-group {}", group_name)))?;

    match cmd.action {
        Action::Add => {
            let network = cmd
                .require_arg("network")?
                .parse()
                .map_err(|_| Error::invalid_argument("bad network"))?;
            let protocol = Protocol::try_from(cmd.require_arg("protocol")?)?;
            let (port_min, port_max) = parse_port_range(cmd.require_arg("port-range")?)?;
            let action = RuleAction::try_from(cmd.require_arg("default")?)?;
            let rule = SecurityGroupRule::new(
                cmd.require_name()?,
                network,
                protocol,
                port_min,
                port_max,
                action,
            )?;
            group.add_rule(rule)?;
            Ok(Response::Done)
        }
        Action::Update => Err(not_updatable(cmd.entity)),
        Action::Remove => {
            group.remove_rule(cmd.require_name()?)?;
            Ok(Response::Done)
        }
        Action::List => Ok(names(
            group.rules().iter().map(|r| r.name.clone()),
        )),
        Action::ListDetail => Ok(Response::List(
            group.rules().iter().map(rule_value).collect(),
        )),
    }
}

fn parse_port_range(input: &str) -> Result<(u16, u32)> {
    let (min, max) = input
        .split_once(',')
        .ok_or_else(|| Error::invalid_argument(format!("bad port-range {}", input)))?;
    let min = min
        .parse()
        .map_err(|_| Error::invalid_argument(format!("bad port-range {}", input)))?;
    let max = max
        .parse()
        .map_err(|_| Error::invalid_argument(format!("bad port-range {}", input)))?;
    Ok((min, max))
}

// ---- listeners -------------------------------------------------------------

fn listener_params(cmd: &EntityCommand) -> Result<ListenerParams> {
    Ok(ListenerParams {
        name: cmd.require_name()?.to_string(),
        address: parse_socket_addr(cmd.require_arg("address")?)?,
        backend: cmd.require_arg("backend")?.to_string(),
        security_group: cmd.arg("security-group").map(str::to_string),
        acceptor_group: cmd.arg("acceptor-elg").map(str::to_string),
        worker_group: cmd.arg("event-loop-group").map(str::to_string),
        in_buffer_size: cmd
            .arg_usize("in-buffer-size")?
            .unwrap_or(DEFAULT_BUFFER_SIZE),
        out_buffer_size: cmd
            .arg_usize("out-buffer-size")?
            .unwrap_or(DEFAULT_BUFFER_SIZE),
    })
}

fn allow_flag(cmd: &EntityCommand) -> Result<Option<bool>> {
    match (
        cmd.has_flag(FLAG_ALLOW_NON_BACKEND),
        cmd.has_flag(FLAG_DENY_NON_BACKEND),
    ) {
        (true, true) => Err(Error::invalid_argument(
            "allow-non-backend conflicts with deny-non-backend",
        )),
        (true, false) => Ok(Some(true)),
        (false, true) => Ok(Some(false)),
        (false, false) => Ok(None),
    }
}

fn listener(app: &App, cmd: EntityCommand, kind: ListenerKind) -> Result<Response> {
    match cmd.action {
        Action::Add => {
            cmd.no_parent()?;
            let params = listener_params(&cmd)?;
            match kind {
                ListenerKind::Tcp => {
                    let protocol = cmd.arg("protocol").unwrap_or("tcp").to_string();
                    let cert_keys = cmd
                        .arg("cert-key")
                        .map(|v| v.split(',').map(str::to_string).collect())
                        .unwrap_or_default();
                    app.add_tcp_lb(params, protocol, cert_keys)?;
                }
                ListenerKind::Socks5 => {
                    let allow = allow_flag(&cmd)?.unwrap_or(false);
                    app.add_socks5_server(params, allow)?;
                }
            }
            Ok(Response::Done)
        }
        Action::Update => {
            app.update_listener(
                cmd.require_name()?,
                kind,
                cmd.arg_usize("in-buffer-size")?,
                cmd.arg_usize("out-buffer-size")?,
                cmd.arg("security-group"),
                allow_flag(&cmd)?,
            )?;
            Ok(Response::Done)
        }
        Action::Remove => {
            app.remove_listener(cmd.require_name()?, kind)?;
            Ok(Response::Done)
        }
        Action::List => Ok(names(
            app.listener_list(Some(kind))
                .iter()
                .map(|l| l.core().name().to_string()),
        )),
        Action::ListDetail => Ok(Response::List(
            app.listener_list(Some(kind))
                .iter()
                .map(|l| serde_json::to_value(l.info()).unwrap_or(Value::Null))
                .collect(),
        )),
    }
}

// ---- cert keys -------------------------------------------------------------

fn cert_key(app: &App, cmd: EntityCommand) -> Result<Response> {
    match cmd.action {
        Action::Add => {
            cmd.no_parent()?;
            let certs: Vec<PathBuf> = cmd
                .require_arg("certs")?
                .split(',')
                .map(PathBuf::from)
                .collect();
            let key = PathBuf::from(cmd.require_arg("key")?);
            app.add_cert_key(cmd.require_name()?, certs, key)?;
            Ok(Response::Done)
        }
        Action::Update => Err(not_updatable(cmd.entity)),
        Action::Remove => {
            app.remove_cert_key(cmd.require_name()?)?;
            Ok(Response::Done)
        }
        Action::List => Ok(names(
            app.cert_key_list().iter().map(|c| c.name().to_string()),
        )),
        Action::ListDetail => Ok(Response::List(
            app.cert_key_list()
                .iter()
                .map(|c| serde_json::to_value(c.info()).unwrap_or(Value::Null))
                .collect(),
        )),
    }
}

// ---- connections / sessions ------------------------------------------------

fn connections(app: &App, cmd: EntityCommand) -> Result<Response> {
    match cmd.action {
        Action::List | Action::ListDetail => {
            let scope = app.resolve_scope(&parser::scope_chain(&cmd.parent)?)?;
            let conns = app.registry().list_connections(&scope);
            if cmd.action == Action::List {
                Ok(names(conns.iter().map(|c| c.canonical())))
            } else {
                Ok(Response::List(
                    conns
                        .iter()
                        .map(|c| serde_json::to_value(c.info()).unwrap_or(Value::Null))
                        .collect(),
                ))
            }
        }
        _ => Err(Error::invalid_argument(
            "connections are torn down with force-remove",
        )),
    }
}

fn sessions(app: &App, cmd: EntityCommand) -> Result<Response> {
    match cmd.action {
        Action::List | Action::ListDetail => {
            let chain = parser::scope_chain(&cmd.parent)?;
            if !matches!(chain, ScopeChain::Listener { .. }) {
                return Err(Error::invalid_argument("sessions are scoped to listeners"));
            }
            let scope = app.resolve_scope(&chain)?;
            let sessions = app.registry().list_sessions(&scope);
            if cmd.action == Action::List {
                Ok(names(sessions.iter().map(|s| s.canonical())))
            } else {
                Ok(Response::List(
                    sessions
                        .iter()
                        .map(|s| serde_json::to_value(s.info()).unwrap_or(Value::Null))
                        .collect(),
                ))
            }
        }
        _ => Err(Error::invalid_argument(
            "sessions are torn down with force-remove",
        )),
    }
}

// ---- forced teardown -------------------------------------------------------

fn regex_selector(selector: &str) -> Option<&str> {
    if selector.len() >= 2 && selector.starts_with('/') && selector.ends_with('/') {
        Some(&selector[1..selector.len() - 1])
    } else {
        None
    }
}

fn execute_force_remove(app: &App, cmd: ForceRemoveCommand) -> Result<Response> {
    if cmd.kind == ForceRemoveKind::Session && !matches!(cmd.scope, ScopeChain::Listener { .. }) {
        return Err(Error::invalid_argument("sessions are scoped to listeners"));
    }
    let scope = app.resolve_scope(&cmd.scope)?;
    let registry = app.registry();

    let count = match (cmd.kind, regex_selector(&cmd.selector)) {
        (ForceRemoveKind::Connection, Some(pattern)) => {
            registry.remove_connections_matching(pattern, &scope)?
        }
        (ForceRemoveKind::Connection, None) => {
            registry.remove_connection_exact(&cmd.selector, &scope)?
        }
        (ForceRemoveKind::Session, Some(pattern)) => {
            registry.remove_sessions_matching(pattern, &scope)?
        }
        (ForceRemoveKind::Session, None) => {
            registry.remove_session_exact(&cmd.selector, &scope)?
        }
    };
    Ok(Response::Removed(count))
}

// ---- projections -----------------------------------------------------------

fn server_value(server: &Server) -> Value {
    json!({
        "name": server.name(),
        "address": server.address().to_string(),
        "weight": server.weight(),
        "currentlyUp": server.is_up(),
        "activeSessions": server.active_sessions(),
        "bytesFromRemote": server.bytes_from_remote(),
        "bytesToRemote": server.bytes_to_remote(),
    })
}

fn server_group_detail(group: &ServerGroup) -> Value {
    let config = group.check_config();
    json!({
        "name": group.name(),
        "method": group.method().to_string(),
        "eventLoopGroup": group.event_loop_group().name(),
        "timeout": config.timeout.as_millis() as u64,
        "period": config.period.as_millis() as u64,
        "up": config.up,
        "down": config.down,
        "servers": group.servers().iter().map(|s| server_value(s)).collect::<Vec<_>>(),
    })
}

fn rule_value(rule: &SecurityGroupRule) -> Value {
    json!({
        "name": rule.name,
        "clientNetwork": rule.client_network.to_string(),
        "protocol": rule.protocol.to_string(),
        "serverPortMin": rule.port_min,
        "serverPortMax": rule.port_max,
        "rule": rule.action.to_string(),
    })
}

fn security_group_detail(group: &SecurityGroup) -> Value {
    json!({
        "name": group.name(),
        "defaultRule": group.default_action().to_string(),
        "rules": group.rules().iter().map(rule_value).collect::<Vec<_>>(),
    })
}
