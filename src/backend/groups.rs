//! Group-of-groups aggregates used as listener backends

use super::group::ServerGroup;
use super::method::{self, WrrState};
use super::server::Server;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Member {
    group: Arc<ServerGroup>,
    weight: AtomicU32,
}

/// A named weighted aggregate of server group references. Selection runs
/// weighted round robin across constituent groups that currently have at
/// least one UP server, then delegates to that group's own method.
pub struct ServerGroups {
    name: String,
    members: RwLock<Arc<Vec<Arc<Member>>>>,
    wrr: Mutex<WrrState>,
}

impl ServerGroups {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(ServerGroups {
            name: name.to_string(),
            members: RwLock::new(Arc::new(Vec::new())),
            wrr: Mutex::new(WrrState::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_group(&self, group: Arc<ServerGroup>, weight: u32) -> Result<()> {
        let mut members = self.members.write();
        if members.iter().any(|m| m.group.name() == group.name()) {
            return Err(Error::already_exists(format!(
                "server-group {}",
                group.name()
            )));
        }
        let mut next = members.as_ref().clone();
        next.push(Arc::new(Member {
            group,
            weight: AtomicU32::new(weight),
        }));
        *members = Arc::new(next);
        Ok(())
    }

    pub fn remove_group(&self, name: &str) -> Result<()> {
        let mut members = self.members.write();
        let idx = members
            .iter()
            .position(|m| m.group.name() == name)
            .ok_or_else(|| Error::not_found(format!("server-group {}", name)))?;
        let mut next = members.as_ref().clone();
        next.remove(idx);
        *members = Arc::new(next);
        Ok(())
    }

    pub fn set_group_weight(&self, name: &str, weight: u32) -> Result<()> {
        let members = self.members.read();
        let member = members
            .iter()
            .find(|m| m.group.name() == name)
            .ok_or_else(|| Error::not_found(format!("server-group {}", name)))?;
        member.weight.store(weight, Ordering::Relaxed);
        Ok(())
    }

    /// (group, weight) members in insertion order.
    pub fn members(&self) -> Vec<(Arc<ServerGroup>, u32)> {
        self.members
            .read()
            .iter()
            .map(|m| (m.group.clone(), m.weight.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn contains_group(&self, name: &str) -> bool {
        self.members
            .read()
            .iter()
            .any(|m| m.group.name() == name)
    }

    /// Find a member server by backend address across all groups.
    pub fn lookup_server(&self, address: SocketAddr) -> Option<(Arc<ServerGroup>, Arc<Server>)> {
        let members = self.members.read().clone();
        for member in members.iter() {
            if let Some(server) = member.group.find_by_address(address) {
                return Some((member.group.clone(), server));
            }
        }
        None
    }

    /// Select a backend server for `key`. Fails NoHealthyServer when no
    /// constituent group has an UP server.
    pub fn select(&self, key: IpAddr) -> Result<Arc<Server>> {
        let members = self.members.read().clone();
        let candidates: Vec<&Arc<Member>> = members
            .iter()
            .filter(|m| m.weight.load(Ordering::Relaxed) > 0 && m.group.has_up())
            .collect();
        if candidates.is_empty() {
            return Err(Error::no_healthy_server(format!(
                "server-groups {}",
                self.name
            )));
        }

        let items: Vec<(&str, u32)> = candidates
            .iter()
            .map(|m| (m.group.name(), m.weight.load(Ordering::Relaxed)))
            .collect();
        let idx = {
            let mut state = self.wrr.lock();
            method::smooth_wrr(&mut state, &items)
        }
        .ok_or_else(|| Error::no_healthy_server(format!("server-groups {}", self.name)))?;

        candidates[idx].group.select_server(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::healthcheck::HealthCheckConfig;
    use crate::backend::method::Method;
    use crate::eventloop::EventLoopGroup;
    use crate::registry::ConnectionRegistry;

    fn group_with_server(
        elg: &Arc<EventLoopGroup>,
        group_name: &str,
        port: u16,
        up: bool,
    ) -> Arc<ServerGroup> {
        let group = ServerGroup::new(
            group_name,
            HealthCheckConfig::default(),
            Method::Wrr,
            elg.clone(),
        );
        let server = group
            .add_server(
                "s0",
                format!("127.0.0.1:{}", port).parse().unwrap(),
                10,
            )
            .unwrap();
        if up {
            let config = HealthCheckConfig::new(1000, 5000, 2, 3).unwrap();
            server.record_probe(true, &config);
            server.record_probe(true, &config);
        }
        group
    }

    #[tokio::test]
    async fn test_all_groups_down_is_no_healthy_server() {
        let elg = EventLoopGroup::new("check");
        elg.add_loop("el0").unwrap();

        let groups = ServerGroups::new("backends");
        groups
            .add_group(group_with_server(&elg, "g0", 9001, false), 10)
            .unwrap();
        groups
            .add_group(group_with_server(&elg, "g1", 9002, false), 10)
            .unwrap();

        let err = groups.select("10.0.0.1".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::NoHealthyServer(_)));

        for (g, _) in groups.members() {
            g.stop_checks();
        }
        elg.stop_all(&ConnectionRegistry::new());
    }

    #[tokio::test]
    async fn test_select_skips_groups_without_up_servers() {
        let elg = EventLoopGroup::new("check");
        elg.add_loop("el0").unwrap();

        let groups = ServerGroups::new("backends");
        groups
            .add_group(group_with_server(&elg, "dead", 9001, false), 100)
            .unwrap();
        groups
            .add_group(group_with_server(&elg, "live", 9002, true), 1)
            .unwrap();

        for _ in 0..20 {
            let server = groups.select("10.0.0.1".parse().unwrap()).unwrap();
            assert_eq!(server.address().port(), 9002);
        }

        for (g, _) in groups.members() {
            g.stop_checks();
        }
        elg.stop_all(&ConnectionRegistry::new());
    }

    #[tokio::test]
    async fn test_duplicate_member_fails() {
        let elg = EventLoopGroup::new("check");
        elg.add_loop("el0").unwrap();

        let groups = ServerGroups::new("backends");
        let g0 = group_with_server(&elg, "g0", 9001, false);
        groups.add_group(g0.clone(), 10).unwrap();
        let err = groups.add_group(g0.clone(), 20).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(groups.members().len(), 1);

        g0.stop_checks();
        elg.stop_all(&ConnectionRegistry::new());
    }

    #[tokio::test]
    async fn test_lookup_server_by_address() {
        let elg = EventLoopGroup::new("check");
        elg.add_loop("el0").unwrap();

        let groups = ServerGroups::new("backends");
        let g0 = group_with_server(&elg, "g0", 9001, false);
        groups.add_group(g0.clone(), 10).unwrap();

        let found = groups.lookup_server("127.0.0.1:9001".parse().unwrap());
        assert!(found.is_some());
        assert!(groups
            .lookup_server("127.0.0.1:9999".parse().unwrap())
            .is_none());

        g0.stop_checks();
        elg.stop_all(&ConnectionRegistry::new());
    }
}
