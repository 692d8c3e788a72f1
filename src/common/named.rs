//! Insertion-ordered collections of uniquely named entities.
//!
//! Every administrative scope in the proxy (loops in a group, servers in a
//! group, rules in a security group, ...) shares the same contract: names are
//! unique within the scope, creation with a duplicate name fails without
//! mutating anything, and listing preserves creation order.

use crate::{Error, Result};

/// Ordered set of named entities.
pub struct NamedSet<T> {
    kind: &'static str,
    items: Vec<(String, T)>,
}

impl<T> NamedSet<T> {
    /// `kind` is the entity kind used in error messages, e.g. "server".
    pub fn new(kind: &'static str) -> Self {
        NamedSet {
            kind,
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.items.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Lookup that fails with NotFound, for administrative paths.
    pub fn require(&self, name: &str) -> Result<&T> {
        self.get(name)
            .ok_or_else(|| Error::not_found(format!("{} {}", self.kind, name)))
    }

    /// Append a new entity. Fails AlreadyExists without mutating the set.
    pub fn insert(&mut self, name: String, value: T) -> Result<()> {
        if self.contains(&name) {
            return Err(Error::already_exists(format!("{} {}", self.kind, name)));
        }
        self.items.push((name, value));
        Ok(())
    }

    /// Remove an entity by name, returning it. Fails NotFound when absent.
    pub fn remove(&mut self, name: &str) -> Result<T> {
        match self.items.iter().position(|(n, _)| n == name) {
            Some(idx) => Ok(self.items.remove(idx).1),
            None => Err(Error::not_found(format!("{} {}", self.kind, name))),
        }
    }

    /// Entities in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter().map(|(_, v)| v)
    }

    pub fn names(&self) -> Vec<String> {
        self.items.iter().map(|(n, _)| n.clone()).collect()
    }
}
