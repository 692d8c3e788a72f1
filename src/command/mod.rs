//! Administrative command grammar and execution
//!
//! The HTTP/CLI front ends are thin translators into this grammar; the
//! parser and executor here are the whole control surface of the core.

mod exec;
mod parser;

pub use exec::{execute, execute_parsed, Response};
pub use parser::{
    parse, scope_chain, Action, AdminCommand, Entity, EntityCommand, ForceRemoveCommand,
    ForceRemoveKind, ScopeChain, FLAG_ALLOW_NON_BACKEND, FLAG_DENY_NON_BACKEND,
};
