//! Administrative command grammar
//!
//! ```text
//! add|update|remove <entity> <name> [to|in|from <parent-entity> <parent-name>...] [<key> <value>]...
//! list|list-detail <entity> [in <scope-chain>]
//! force-remove connection|session <selector> in <scope-chain>
//! ```
//!
//! Scope chains nest parent pairs, e.g.
//! `event-loop-group elg0 event-loop el0` or `server-group sg0 server s1`.

use crate::{Error, Result};
use std::collections::HashMap;

/// Administrable entity kinds. `Connection` and `Session` are query-only;
/// their teardown goes through force-remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    EventLoopGroup,
    EventLoop,
    ServerGroups,
    ServerGroup,
    Server,
    SecurityGroup,
    SecurityGroupRule,
    TcpLb,
    Socks5Server,
    CertKey,
    Connection,
    Session,
}

impl TryFrom<&str> for Entity {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "event-loop-group" => Ok(Entity::EventLoopGroup),
            "event-loop" => Ok(Entity::EventLoop),
            "server-groups" => Ok(Entity::ServerGroups),
            "server-group" => Ok(Entity::ServerGroup),
            "server" => Ok(Entity::Server),
            "security-group" => Ok(Entity::SecurityGroup),
            "security-group-rule" => Ok(Entity::SecurityGroupRule),
            "tcp-lb" => Ok(Entity::TcpLb),
            "socks5-server" => Ok(Entity::Socks5Server),
            "cert-key" => Ok(Entity::CertKey),
            "connection" => Ok(Entity::Connection),
            "session" => Ok(Entity::Session),
            _ => Err(Error::invalid_argument(format!("unknown entity {}", s))),
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Entity::EventLoopGroup => "event-loop-group",
            Entity::EventLoop => "event-loop",
            Entity::ServerGroups => "server-groups",
            Entity::ServerGroup => "server-group",
            Entity::Server => "server",
            Entity::SecurityGroup => "security-group",
            Entity::SecurityGroupRule => "security-group-rule",
            Entity::TcpLb => "tcp-lb",
            Entity::Socks5Server => "socks5-server",
            Entity::CertKey => "cert-key",
            Entity::Connection => "connection",
            Entity::Session => "session",
        };
        write!(f, "{}", s)
    }
}

/// What an entity command does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Update,
    Remove,
    List,
    ListDetail,
}

/// Valueless toggles (SOCKS5 only).
pub const FLAG_ALLOW_NON_BACKEND: &str = "allow-non-backend";
pub const FLAG_DENY_NON_BACKEND: &str = "deny-non-backend";

/// A parsed entity command.
#[derive(Debug, Clone)]
pub struct EntityCommand {
    pub action: Action,
    pub entity: Entity,
    pub name: Option<String>,
    /// Parent scope pairs in nesting order, outermost first.
    pub parent: Vec<(Entity, String)>,
    pub args: HashMap<String, String>,
    pub flags: Vec<String>,
}

impl EntityCommand {
    pub fn require_name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .ok_or_else(|| Error::invalid_argument(format!("{} needs a name", self.entity)))
    }

    /// The single parent this entity nests under.
    pub fn require_parent(&self, expected: Entity) -> Result<&str> {
        match self.parent.as_slice() {
            [(entity, name)] if *entity == expected => Ok(name),
            [] => Err(Error::invalid_argument(format!(
                "{} needs a parent {}",
                self.entity, expected
            ))),
            _ => Err(Error::invalid_argument(format!(
                "bad parent scope for {}",
                self.entity
            ))),
        }
    }

    pub fn no_parent(&self) -> Result<()> {
        if self.parent.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "{} does not nest",
                self.entity
            )))
        }
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn require_arg(&self, key: &str) -> Result<&str> {
        self.arg(key)
            .ok_or_else(|| Error::invalid_argument(format!("missing {}", key)))
    }

    pub fn arg_u32(&self, key: &str, default: u32) -> Result<u32> {
        match self.arg(key) {
            Some(v) => v
                .parse()
                .map_err(|_| Error::invalid_argument(format!("bad {} {}", key, v))),
            None => Ok(default),
        }
    }

    pub fn arg_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.arg(key) {
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| Error::invalid_argument(format!("bad {} {}", key, v))),
            None => Ok(None),
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

/// Forced teardown target kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceRemoveKind {
    Connection,
    Session,
}

/// Where a forced teardown or connection query looks for its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeChain {
    EventLoop { group: String, name: String },
    Listener { entity: Entity, name: String },
    Server { group: String, name: String },
}

/// Interpret parent pairs as a registry scope chain.
pub fn scope_chain(chain: &[(Entity, String)]) -> Result<ScopeChain> {
    match chain {
        [(Entity::EventLoopGroup, group), (Entity::EventLoop, name)] => {
            Ok(ScopeChain::EventLoop {
                group: group.clone(),
                name: name.clone(),
            })
        }
        [(entity @ (Entity::TcpLb | Entity::Socks5Server), name)] => Ok(ScopeChain::Listener {
            entity: *entity,
            name: name.clone(),
        }),
        [(Entity::ServerGroup, group), (Entity::Server, name)] => Ok(ScopeChain::Server {
            group: group.clone(),
            name: name.clone(),
        }),
        _ => Err(Error::invalid_argument("bad scope chain")),
    }
}

/// A parsed force-remove command.
#[derive(Debug, Clone)]
pub struct ForceRemoveCommand {
    pub kind: ForceRemoveKind,
    pub selector: String,
    pub scope: ScopeChain,
}

/// Any parsed administrative command.
#[derive(Debug, Clone)]
pub enum AdminCommand {
    Entity(EntityCommand),
    ForceRemove(ForceRemoveCommand),
}

/// Parse one command line.
pub fn parse(input: &str) -> Result<AdminCommand> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(Error::invalid_argument("empty command"));
    }

    match tokens[0] {
        "add" => parse_entity(Action::Add, &tokens[1..], true),
        "update" => parse_entity(Action::Update, &tokens[1..], true),
        "remove" => parse_entity(Action::Remove, &tokens[1..], true),
        "list" => parse_entity(Action::List, &tokens[1..], false),
        "list-detail" => parse_entity(Action::ListDetail, &tokens[1..], false),
        "force-remove" => parse_force_remove(&tokens[1..]),
        other => Err(Error::invalid_argument(format!("unknown action {}", other))),
    }
}

/// Parse `<entity> <name>` pairs greedily. The chain ends at the first
/// token that is not an entity name, which is where the key/value block
/// starts.
fn parse_chain(tokens: &[&str], idx: &mut usize) -> Result<Vec<(Entity, String)>> {
    let mut chain = Vec::new();
    while let Some(token) = tokens.get(*idx) {
        let Ok(entity) = Entity::try_from(*token) else {
            break;
        };
        let name = tokens
            .get(*idx + 1)
            .ok_or_else(|| Error::invalid_argument(format!("missing name after {}", entity)))?;
        chain.push((entity, (*name).to_string()));
        *idx += 2;
    }
    if chain.is_empty() {
        return Err(Error::invalid_argument("missing parent entity"));
    }
    Ok(chain)
}

fn parse_entity(action: Action, tokens: &[&str], named: bool) -> Result<AdminCommand> {
    let mut idx = 0;
    let entity = Entity::try_from(
        *tokens
            .get(idx)
            .ok_or_else(|| Error::invalid_argument("missing entity"))?,
    )?;
    idx += 1;

    let name = if named {
        let n = tokens
            .get(idx)
            .ok_or_else(|| Error::invalid_argument(format!("{} needs a name", entity)))?;
        idx += 1;
        Some((*n).to_string())
    } else {
        None
    };

    let parent = match tokens.get(idx) {
        Some(&"to") | Some(&"in") | Some(&"from") => {
            idx += 1;
            parse_chain(tokens, &mut idx)?
        }
        _ => Vec::new(),
    };

    let mut args = HashMap::new();
    let mut flags = Vec::new();
    while idx < tokens.len() {
        let key = tokens[idx];
        if key == FLAG_ALLOW_NON_BACKEND || key == FLAG_DENY_NON_BACKEND {
            flags.push(key.to_string());
            idx += 1;
            continue;
        }
        let value = tokens
            .get(idx + 1)
            .ok_or_else(|| Error::invalid_argument(format!("missing value for {}", key)))?;
        if args.insert(key.to_string(), (*value).to_string()).is_some() {
            return Err(Error::invalid_argument(format!("duplicate key {}", key)));
        }
        idx += 2;
    }

    Ok(AdminCommand::Entity(EntityCommand {
        action,
        entity,
        name,
        parent,
        args,
        flags,
    }))
}

fn parse_force_remove(tokens: &[&str]) -> Result<AdminCommand> {
    let kind = match tokens.first() {
        Some(&"connection") => ForceRemoveKind::Connection,
        Some(&"session") => ForceRemoveKind::Session,
        _ => {
            return Err(Error::invalid_argument(
                "force-remove expects connection or session",
            ))
        }
    };
    let selector = tokens
        .get(1)
        .ok_or_else(|| Error::invalid_argument("missing selector"))?
        .to_string();
    if tokens.get(2) != Some(&"in") {
        return Err(Error::invalid_argument("missing scope (expected `in ...`)"));
    }

    let mut idx = 3;
    let chain = parse_chain(tokens, &mut idx)?;
    if idx != tokens.len() {
        return Err(Error::invalid_argument(format!(
            "trailing tokens after scope: {}",
            tokens[idx..].join(" ")
        )));
    }
    let scope = scope_chain(&chain)?;

    Ok(AdminCommand::ForceRemove(ForceRemoveCommand {
        kind,
        selector,
        scope,
    }))
}
