// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use super::bolt::RouteServer;
use super::RoutingControl;
use crate::address_::Address;
use crate::time::Instant;

/// How much longer than its ttl a routing table is kept in memory
/// before it is dropped entirely.
const PURGE_GRACE: Duration = Duration::from_secs(30);

/// The per-database map from server role to server addresses, as
/// reported by a router, with an expiry.
#[derive(Debug)]
pub(crate) struct RoutingTable {
    pub(crate) routers: Vec<Arc<Address>>,
    pub(crate) readers: Vec<Arc<Address>>,
    pub(crate) writers: Vec<Arc<Address>>,
    pub(crate) database: Option<Arc<String>>,
    /// Whether the latest update yielded no writers. Used to bias the
    /// next update towards the initial router.
    pub(crate) initialized_without_writers: bool,
    pub(crate) last_updated_time: Instant,
    ttl: Duration,
}

impl RoutingTable {
    /// A stale seed table, knowing nothing but the initial router.
    pub(crate) fn new(database: Option<Arc<String>>, initial_router: Arc<Address>) -> Self {
        Self {
            routers: vec![initial_router],
            readers: Vec::new(),
            writers: Vec::new(),
            database,
            initialized_without_writers: true,
            last_updated_time: Instant::now(),
            ttl: Duration::new(0, 0),
        }
    }

    /// Assemble a table from the `servers` entries of a ROUTE reply.
    pub(crate) fn parse_routing_info(
        database: Option<Arc<String>>,
        servers: Vec<RouteServer>,
        ttl: i64,
    ) -> Result<Self, RoutingTableParseError> {
        if ttl < 0 {
            return Err(RoutingTableParseError {
                reason: "negative \"ttl\"",
            });
        }
        let ttl = Duration::from_secs(ttl as u64);
        let mut routers = Vec::new();
        let mut readers = Vec::new();
        let mut writers = Vec::new();
        for server in servers {
            let addresses = server
                .addresses
                .iter()
                .map(|address| Arc::new(Address::from(address.as_str())))
                .collect();
            match server.role.as_str().into() {
                ServerRole::Router => routers = addresses,
                ServerRole::Reader => readers = addresses,
                ServerRole::Writer => writers = addresses,
                ServerRole::Unknown => {
                    warn!("ignoring unknown server role {}", server.role);
                }
            }
        }
        let initialized_without_writers = writers.is_empty();
        Ok(Self {
            routers,
            readers,
            writers,
            database,
            initialized_without_writers,
            last_updated_time: Instant::now(),
            ttl,
        })
    }

    pub(crate) fn servers_for_mode(&self, mode: RoutingControl) -> &[Arc<Address>] {
        match mode {
            RoutingControl::Read => &self.readers,
            RoutingControl::Write => &self.writers,
        }
    }

    /// All addresses the table currently references, regardless of role.
    pub(crate) fn servers(&self) -> impl Iterator<Item = &Arc<Address>> {
        self.routers
            .iter()
            .chain(self.readers.iter())
            .chain(self.writers.iter())
    }

    /// A table is fresh while it has not outlived its ttl, still knows
    /// routers, and has at least one server for the requested mode.
    pub(crate) fn is_fresh(&self, mode: RoutingControl) -> bool {
        if self.routers.is_empty() {
            debug!("routing table expired: no routers left {self:?}");
            return false;
        }
        if self.servers_for_mode(mode).is_empty() {
            debug!("routing table expired: no servers for {mode:?} mode left {self:?}");
            return false;
        }
        if self.last_updated_time.elapsed() > self.ttl {
            debug!(
                "routing table expired: ttl ({:?}) < age ({:?}) {self:?}",
                self.ttl,
                self.last_updated_time.elapsed(),
            );
            return false;
        }
        true
    }

    pub(crate) fn should_be_purged_from_memory(&self) -> bool {
        self.last_updated_time.elapsed() > self.ttl + PURGE_GRACE
    }

    /// Replace this table's server sets and expiry with a newly fetched
    /// table's.
    pub(crate) fn update(&mut self, new_table: RoutingTable) {
        self.routers = new_table.routers;
        self.readers = new_table.readers;
        self.writers = new_table.writers;
        self.initialized_without_writers = self.writers.is_empty();
        self.database = new_table.database;
        self.last_updated_time = new_table.last_updated_time;
        self.ttl = new_table.ttl;
    }

    /// Forget the address entirely, no matter its roles.
    pub(crate) fn deactivate(&mut self, address: &Address) {
        self.routers.retain(|a| **a != *address);
        self.readers.retain(|a| **a != *address);
        self.deactivate_writer(address);
    }

    /// Forget the address as a writer, keeping its other roles.
    pub(crate) fn deactivate_writer(&mut self, address: &Address) {
        self.writers.retain(|a| **a != *address);
    }
}

#[derive(Error, Debug)]
#[error("failed to parse routing table: {reason}")]
pub(crate) struct RoutingTableParseError {
    reason: &'static str,
}

enum ServerRole {
    Router,
    Reader,
    Writer,
    Unknown,
}

impl From<&str> for ServerRole {
    fn from(s: &str) -> Self {
        match s {
            "ROUTE" => ServerRole::Router,
            "READ" => ServerRole::Reader,
            "WRITE" => ServerRole::Writer,
            _ => ServerRole::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    fn address(host: &str) -> Arc<Address> {
        Arc::new(Address::from(host))
    }

    fn route_server(role: &str, addresses: &[&str]) -> RouteServer {
        RouteServer {
            role: String::from(role),
            addresses: addresses.iter().map(|a| String::from(*a)).collect(),
        }
    }

    fn sample_servers() -> Vec<RouteServer> {
        vec![
            route_server("ROUTE", &["router1:7687"]),
            route_server("READ", &["reader1:7687", "reader2:7687"]),
            route_server("WRITE", &["writer1:7687"]),
        ]
    }

    fn age(table: &mut RoutingTable, by: Duration) {
        table.last_updated_time = table
            .last_updated_time
            .checked_sub(by)
            .expect("test ages tables by less than the process uptime");
    }

    #[test]
    fn test_parse_routing_info() {
        let database = Some(Arc::new(String::from("neo4j")));
        let table =
            RoutingTable::parse_routing_info(database.clone(), sample_servers(), 300).unwrap();
        assert_eq!(table.routers, vec![address("router1:7687")]);
        assert_eq!(
            table.readers,
            vec![address("reader1:7687"), address("reader2:7687")]
        );
        assert_eq!(table.writers, vec![address("writer1:7687")]);
        assert_eq!(table.database, database);
        assert!(!table.initialized_without_writers);
        assert!(table.is_fresh(RoutingControl::Read));
        assert!(table.is_fresh(RoutingControl::Write));
        assert!(!table.should_be_purged_from_memory());
    }

    #[test]
    fn test_expired_table_is_purged_after_grace() {
        let mut table = RoutingTable::parse_routing_info(None, sample_servers(), 300).unwrap();
        age(&mut table, Duration::from_secs(301));
        assert!(!table.is_fresh(RoutingControl::Read));
        assert!(!table.should_be_purged_from_memory());
        age(&mut table, Duration::from_secs(30));
        assert!(table.should_be_purged_from_memory());
    }

    #[test]
    fn test_parse_routing_info_ignores_unknown_roles() {
        let mut servers = sample_servers();
        servers.push(route_server("ARBITER", &["arbiter1:7687"]));
        let table = RoutingTable::parse_routing_info(None, servers, 300).unwrap();
        let arbiter = address("arbiter1:7687");
        assert!(table.servers().all(|a| *a != arbiter));
    }

    #[test]
    fn test_parse_routing_info_rejects_negative_ttl() {
        assert!(RoutingTable::parse_routing_info(None, sample_servers(), -1).is_err());
    }

    #[rstest]
    #[case(RoutingControl::Read, true)]
    #[case(RoutingControl::Write, false)]
    fn test_freshness_without_writers(#[case] mode: RoutingControl, #[case] fresh: bool) {
        let servers = vec![
            route_server("ROUTE", &["router1:7687"]),
            route_server("READ", &["reader1:7687"]),
        ];
        let table = RoutingTable::parse_routing_info(None, servers, 300).unwrap();
        assert!(table.initialized_without_writers);
        assert_eq!(table.is_fresh(mode), fresh);
    }

    #[test]
    fn test_new_table_is_stale_seed() {
        let initial_router = address("localhost:7687");
        let table = RoutingTable::new(None, Arc::clone(&initial_router));
        assert_eq!(table.routers, vec![initial_router]);
        assert!(table.initialized_without_writers);
        assert!(!table.is_fresh(RoutingControl::Read));
        assert!(!table.is_fresh(RoutingControl::Write));
    }

    #[test]
    fn test_deactivate_removes_all_roles() {
        let mut servers = sample_servers();
        servers[0].addresses.push(String::from("reader1:7687"));
        let mut table = RoutingTable::parse_routing_info(None, servers, 300).unwrap();
        table.deactivate(&address("reader1:7687"));
        assert_eq!(table.routers, vec![address("router1:7687")]);
        assert_eq!(table.readers, vec![address("reader2:7687")]);
        assert_eq!(table.writers, vec![address("writer1:7687")]);
    }

    #[test]
    fn test_deactivate_writer_keeps_other_roles() {
        let mut servers = sample_servers();
        servers[1].addresses.push(String::from("writer1:7687"));
        let mut table = RoutingTable::parse_routing_info(None, servers, 300).unwrap();
        table.deactivate_writer(&address("writer1:7687"));
        assert!(table.writers.is_empty());
        assert!(table
            .readers
            .contains(&address("writer1:7687")));
    }

    #[test]
    fn test_update_replaces_servers_and_expiry() {
        let initial_router = address("localhost:7687");
        let mut table = RoutingTable::new(None, initial_router);
        let new_table = RoutingTable::parse_routing_info(
            Some(Arc::new(String::from("neo4j"))),
            sample_servers(),
            300,
        )
        .unwrap();
        table.update(new_table);
        assert_eq!(table.routers, vec![address("router1:7687")]);
        assert!(!table.initialized_without_writers);
        assert_eq!(table.database, Some(Arc::new(String::from("neo4j"))));
        assert!(table.is_fresh(RoutingControl::Write));
    }
}
