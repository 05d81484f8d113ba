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

//! Connection pooling with optional cluster routing.
//!
//! A [`Pool`] hands out exclusively owned, live connections as
//! [`PooledConnection`] guards which return themselves to the pool on
//! drop. The direct flavor serves a single fixed address; the routing
//! flavor keeps one routing table per database, refreshes it from the
//! cluster's routers when it goes stale, and picks the least-used
//! server of the requested role for every acquisition.

mod bolt;
mod inner;
mod routing;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use log::{debug, error, info};
use rand::Rng;

pub use bolt::{
    BoltConnection, ConnectionOpener, RouteParameters, RouteRecord, RouteServer,
};
pub use inner::PooledConnection;

use crate::address_::resolution::AddressResolver;
use crate::address_::Address;
use crate::bookmarks::Bookmarks;
use crate::deadline::Deadline;
use crate::error_::{PoolError, Result, ServerError};
use crate::sync::ReadMostlyLock;
use inner::ConnectionPool;
use routing::RoutingTable;

const DEFAULT_MAX_POOL_SIZE: usize = 100;

/// Whether an acquired connection will be used for reading or writing.
///
/// In a cluster, read work should be directed at readers to keep load
/// off the (possibly single) writer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RoutingControl {
    Read,
    Write,
}

impl RoutingControl {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            RoutingControl::Read => "read",
            RoutingControl::Write => "write",
        }
    }
}

/// Immutable pool configuration.
#[derive(Debug)]
pub struct PoolConfig {
    /// Upper bound on connections per address, counting those still
    /// being opened. `None` means unbounded.
    pub max_connection_pool_size: Option<usize>,
    /// Pooled connections older than this are retired instead of being
    /// handed out again.
    pub max_connection_lifetime: Option<Duration>,
    /// Custom address expansion, applied to router addresses while
    /// updating routing tables.
    pub resolver: Option<Box<dyn AddressResolver>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connection_pool_size: Some(DEFAULT_MAX_POOL_SIZE),
            max_connection_lifetime: None,
            resolver: None,
        }
    }
}

/// Per-acquisition parameters.
#[derive(Copy, Clone)]
pub struct AcquireConfig<'a> {
    pub mode: RoutingControl,
    /// Deadline for the acquisition itself. Mandatory (and positive)
    /// for routing pools.
    pub timeout: Option<Duration>,
    pub database: Option<&'a Arc<String>>,
    /// Bookmarks to pass along when fetching routing tables, keeping
    /// them causally consistent with the caller's transactions.
    pub bookmarks: Option<&'a Bookmarks>,
    pub impersonated_user: Option<&'a str>,
    /// When set, idle connections that have seen no activity for this
    /// long are only handed out after a successful RESET round-trip.
    pub liveness_check_timeout: Option<Duration>,
    /// Invoked (at most once per routing table update) with the
    /// database name the server resolved the request to, when it
    /// differs from the requested one.
    pub on_database_resolved: Option<&'a dyn Fn(&str)>,
}

impl<'a> AcquireConfig<'a> {
    pub fn new(mode: RoutingControl) -> Self {
        Self {
            mode,
            timeout: None,
            database: None,
            bookmarks: None,
            impersonated_user: None,
            liveness_check_timeout: None,
            on_database_resolved: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_database(mut self, database: &'a Arc<String>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_bookmarks(mut self, bookmarks: &'a Bookmarks) -> Self {
        self.bookmarks = Some(bookmarks);
        self
    }

    pub fn with_impersonated_user(mut self, user: &'a str) -> Self {
        self.impersonated_user = Some(user);
        self
    }

    pub fn with_liveness_check_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_check_timeout = Some(timeout);
        self
    }

    pub fn with_database_resolved_callback(mut self, callback: &'a dyn Fn(&str)) -> Self {
        self.on_database_resolved = Some(callback);
        self
    }
}

impl Debug for AcquireConfig<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireConfig")
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .field("database", &self.database)
            .field("bookmarks", &self.bookmarks)
            .field("impersonated_user", &self.impersonated_user)
            .field("liveness_check_timeout", &self.liveness_check_timeout)
            .field(
                "on_database_resolved",
                &self.on_database_resolved.as_ref().map(|_| "..."),
            )
            .finish()
    }
}

/// A collection of connections to one or more server addresses.
#[derive(Debug)]
pub struct Pool {
    config: Arc<PoolConfig>,
    pools: Pools,
}

impl Pool {
    /// A pool holding connections to a single, fixed address.
    pub fn new_direct(address: Address, opener: Box<dyn ConnectionOpener>, config: PoolConfig) -> Self {
        let config = Arc::new(config);
        debug!("pool created, direct address {address}");
        Self {
            pools: Pools::Direct(DirectPool::new(
                Arc::new(address),
                opener,
                Arc::clone(&config),
            )),
            config,
        }
    }

    /// A pool that routes acquisitions across a cluster, bootstrapping
    /// its routing tables from `initial_router`.
    pub fn new_routing(
        initial_router: Address,
        opener: Box<dyn ConnectionOpener>,
        config: PoolConfig,
    ) -> Self {
        let config = Arc::new(config);
        debug!("pool created, routing address {initial_router}");
        Self {
            pools: Pools::Routing(RoutingPool::new(
                Arc::new(initial_router),
                opener,
                Arc::clone(&config),
            )),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    pub fn is_routing(&self) -> bool {
        matches!(self.pools, Pools::Routing(_))
    }

    /// Acquire a live, reset, exclusively owned connection to a server
    /// that can satisfy the given parameters.
    pub fn acquire(&self, args: AcquireConfig) -> Result<PooledConnection> {
        match &self.pools {
            Pools::Direct(pool) => pool.acquire(args),
            Pools::Routing(pool) => pool.acquire(args),
        }
    }

    /// Count the connections to `address` currently handed out.
    pub fn in_use_connection_count(&self, address: &Address) -> usize {
        self.base_pool().in_use_connection_count(address)
    }

    /// Close all idle connections to `address` and stop serving it: a
    /// routing pool also forgets the address in every routing table.
    pub fn deactivate(&self, address: &Address) {
        match &self.pools {
            Pools::Direct(pool) => pool.pool.deactivate(address),
            Pools::Routing(pool) => pool.deactivate(address),
        }
    }

    /// Tell the pool that `address` failed to serve a write. The
    /// address is only removed from the writer sets; no connections are
    /// closed.
    pub fn on_write_failure(&self, address: &Address) -> Result<()> {
        match &self.pools {
            Pools::Direct(pool) => pool.on_write_failure(),
            Pools::Routing(pool) => {
                pool.on_write_failure(address);
                Ok(())
            }
        }
    }

    /// Apply the pool-relevant consequences of a server-reported error
    /// received over a connection to `address`.
    pub fn on_server_error(&self, address: &Address, error: &ServerError) {
        let Pools::Routing(pool) = &self.pools else {
            return;
        };
        if error.deactivates_server() {
            pool.deactivate(address);
        } else if error.invalidates_writer() {
            pool.on_write_failure(address);
        }
    }

    /// Make every pooled connection fail its next health check, forcing
    /// fresh connections from here on.
    pub fn mark_all_stale(&self) {
        self.base_pool().mark_all_stale()
    }

    /// Close all connections and empty the pool. Idempotent.
    pub fn close(&self) {
        self.base_pool().close()
    }

    fn base_pool(&self) -> &ConnectionPool {
        match &self.pools {
            Pools::Direct(pool) => &pool.pool,
            Pools::Routing(pool) => &pool.pool,
        }
    }
}

#[derive(Debug)]
enum Pools {
    Direct(DirectPool),
    Routing(RoutingPool),
}

#[derive(Debug)]
struct DirectPool {
    address: Arc<Address>,
    pool: ConnectionPool,
}

impl DirectPool {
    fn new(address: Arc<Address>, opener: Box<dyn ConnectionOpener>, config: Arc<PoolConfig>) -> Self {
        Self {
            pool: ConnectionPool::new(opener, config),
            address,
        }
    }

    fn acquire(&self, args: AcquireConfig) -> Result<PooledConnection> {
        // mode and database are meaningless for a direct connection;
        // they are accepted for consistency only
        debug!(
            "acquiring direct connection, mode={:?}, database={:?}",
            args.mode, args.database
        );
        self.pool.acquire(
            &self.address,
            Deadline::from_timeout_opt(args.timeout),
            args.liveness_check_timeout,
        )
    }

    fn on_write_failure(&self) -> Result<()> {
        Err(PoolError::write_service_unavailable(format!(
            "no write service available for pool towards {}",
            self.address
        )))
    }
}

type RoutingTables = HashMap<Option<Arc<String>>, RoutingTable>;

struct TableUpdate {
    database: Option<Arc<String>>,
}

#[derive(Debug)]
struct RoutingPool {
    pool: ConnectionPool,
    address: Arc<Address>,
    routing_tables: ReadMostlyLock<RoutingTables>,
    config: Arc<PoolConfig>,
}

impl RoutingPool {
    fn new(address: Arc<Address>, opener: Box<dyn ConnectionOpener>, config: Arc<PoolConfig>) -> Self {
        Self {
            pool: ConnectionPool::new(opener, Arc::clone(&config)),
            address,
            routing_tables: ReadMostlyLock::new(HashMap::new()),
            config,
        }
    }

    fn acquire(&self, args: AcquireConfig) -> Result<PooledConnection> {
        let timeout = match args.timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => {
                return Err(PoolError::client_error(
                    "connection acquisition timeout must be greater than zero",
                ))
            }
        };
        debug!(
            "acquiring {:?} connection towards {}",
            args.mode,
            args.database
                .map(|db| format!("{db:?}"))
                .unwrap_or_else(|| String::from("the default database"))
        );
        let database = self.ensure_routing_table_is_fresh(args)?;
        loop {
            let address = match self.select_address(args.mode, database.as_ref()) {
                Ok(address) => address,
                Err(
                    err @ (PoolError::ReadServiceUnavailable { .. }
                    | PoolError::WriteServiceUnavailable { .. }),
                ) => {
                    return Err(PoolError::session_expired(format!(
                        "failed to obtain a connection towards a {} server: {err}",
                        args.mode.as_str()
                    )));
                }
                Err(err) => return Err(err),
            };
            debug!(
                "acquiring connection, database={:?}, address={}",
                database, address
            );
            match self.pool.acquire(
                &address,
                Deadline::from_timeout(timeout),
                args.liveness_check_timeout,
            ) {
                Err(PoolError::ServiceUnavailable { .. } | PoolError::SessionExpired { .. }) => {
                    self.deactivate(&address)
                }
                result => return result,
            }
        }
    }

    /// Update the routing table for the requested database if it is
    /// stale, pruning aged tables and pool entries no longer backed by
    /// any table along the way.
    ///
    /// Returns the key under which the current table is stored; it
    /// differs from the requested database when the server resolved the
    /// request to another database name.
    fn ensure_routing_table_is_fresh(&self, args: AcquireConfig) -> Result<Option<Arc<String>>> {
        let db_key = args.database.map(Arc::clone);
        let resolved_key = RefCell::new(db_key.clone());
        {
            let resolved_key = &resolved_key;
            let db_key = &db_key;
            drop(self.routing_tables.maybe_write(
                |rts| {
                    rts.values()
                        .any(RoutingTable::should_be_purged_from_memory)
                        || rts
                            .get(db_key)
                            .map(|rt| !rt.is_fresh(args.mode))
                            .unwrap_or(true)
                },
                |mut rts| {
                    rts.retain(|database, rt| {
                        let purge = rt.should_be_purged_from_memory();
                        if purge {
                            debug!("dropping aged routing table for {database:?}");
                        }
                        !purge
                    });
                    let is_fresh = rts
                        .entry(db_key.clone())
                        .or_insert_with(|| self.empty_rt(db_key.clone()))
                        .is_fresh(args.mode);
                    if is_fresh {
                        debug!("using existing routing table for {db_key:?}");
                        return Ok(());
                    }
                    let update = self.update_routing_table(args, &mut rts)?;
                    self.prune_unused_connections(&update.database, &rts);
                    *resolved_key.borrow_mut() = update.database;
                    Ok(())
                },
            )?);
        }
        Ok(resolved_key.into_inner())
    }

    fn update_routing_table(
        &self,
        args: AcquireConfig,
        rts: &mut RoutingTables,
    ) -> Result<TableUpdate> {
        let db_key = args.database.map(Arc::clone);
        debug!("fetching new routing table for {db_key:?}");
        let rt = rts
            .entry(db_key.clone())
            .or_insert_with(|| self.empty_rt(db_key.clone()));
        let prefer_initial_router = rt.initialized_without_writers;
        let existing_routers = rt
            .routers
            .iter()
            .filter(|&router| router != &self.address)
            .map(Arc::clone)
            .collect::<Vec<_>>();
        let initial_router = [Arc::clone(&self.address)];
        if prefer_initial_router {
            if let Some(update) = self.update_routing_table_from(&initial_router, args, rts)? {
                return Ok(update);
            }
            if !existing_routers.is_empty() {
                if let Some(update) = self.update_routing_table_from(&existing_routers, args, rts)?
                {
                    return Ok(update);
                }
            }
        } else {
            if let Some(update) = self.update_routing_table_from(&existing_routers, args, rts)? {
                return Ok(update);
            }
            if let Some(update) = self.update_routing_table_from(&initial_router, args, rts)? {
                return Ok(update);
            }
        }
        error!("unable to retrieve routing information");
        Err(PoolError::disconnect("unable to retrieve routing information"))
    }

    /// Try the given routers in order until one provides a usable
    /// table; merge it and report back. Routers that don't resolve or
    /// whose every resolved address fails are deactivated.
    fn update_routing_table_from(
        &self,
        routers: &[Arc<Address>],
        args: AcquireConfig,
        rts: &mut RoutingTables,
    ) -> Result<Option<TableUpdate>> {
        if !routers.is_empty() {
            debug!(
                "attempting to update routing table from {}",
                routers.iter().map(|router| format!("{router}")).join(", ")
            );
        }
        for router in routers {
            for resolved in
                Arc::clone(router).fully_resolve(self.config.resolver.as_deref())?
            {
                let Ok(resolved) = resolved else {
                    continue;
                };
                if let Some(new_rt) = self.fetch_routing_table(&resolved, args)? {
                    let database = new_rt.database.clone();
                    rts.entry(database.clone())
                        .or_insert_with(|| self.empty_rt(database.clone()))
                        .update(new_rt);
                    debug!("updated routing table for {database:?} from {resolved}");
                    self.report_resolved_database(args, &database);
                    return Ok(Some(TableUpdate { database }));
                }
            }
            self.deactivate_locked(router, rts);
        }
        Ok(None)
    }

    fn report_resolved_database(&self, args: AcquireConfig, database: &Option<Arc<String>>) {
        let Some(callback) = args.on_database_resolved else {
            return;
        };
        let Some(database) = database.as_ref() else {
            return;
        };
        let changed = args
            .database
            .map(|requested| requested.as_str() != database.as_str())
            .unwrap_or(true);
        if changed {
            callback(database);
        }
    }

    /// Fetch a routing table from the given (resolved) router address.
    ///
    /// Returns `None` when the router cannot be reached or replies with
    /// a table lacking routers or readers; such a router is not worth
    /// keeping. Errors that are fatal during discovery abort the whole
    /// update instead.
    fn fetch_routing_table(
        &self,
        address: &Arc<Address>,
        args: AcquireConfig,
    ) -> Result<Option<RoutingTable>> {
        let deadline = Deadline::from_timeout_opt(args.timeout);
        debug!(
            "acquiring router connection, database={:?}, address={}",
            args.database, address
        );
        let mut connection = match self.pool.acquire(address, deadline, None) {
            Ok(connection) => connection,
            Err(err) => return Self::discovery_failure(address, err),
        };
        let records = connection.route(RouteParameters::new(
            args.database.map(|db| db.as_str()),
            args.impersonated_user,
            args.bookmarks,
        ));
        drop(connection);
        let records = match records {
            Ok(records) => records,
            Err(err) => return Self::discovery_failure(address, err),
        };
        let Some(record) = records.into_iter().next() else {
            debug!("failed to fetch routing info from {address}");
            return Ok(None);
        };
        let database = record
            .db
            .map(Arc::new)
            .or_else(|| args.database.map(Arc::clone));
        let new_rt = RoutingTable::parse_routing_info(database, record.servers, record.ttl)
            .map_err(|err| PoolError::protocol_error(err.to_string()))?;
        if new_rt.routers.is_empty() {
            debug!("no routing servers returned from server {address}");
            return Ok(None);
        }
        if new_rt.readers.is_empty() {
            debug!("no read servers returned from server {address}");
            return Ok(None);
        }
        // If no writers are available, this likely indicates a temporary
        // state, such as leader switching, so it is not an error.
        Ok(Some(new_rt))
    }

    fn discovery_failure(address: &Address, err: PoolError) -> Result<Option<RoutingTable>> {
        if err.fatal_during_discovery() {
            return Err(err);
        }
        match err {
            PoolError::ServiceUnavailable { .. }
            | PoolError::SessionExpired { .. }
            | PoolError::Server { .. } => {
                info!("ignored error during discovery from {address}: {err}");
                Ok(None)
            }
            err => Err(err),
        }
    }

    fn select_address(
        &self,
        mode: RoutingControl,
        database: Option<&Arc<String>>,
    ) -> Result<Arc<Address>> {
        self.select_address_with(&mut rand::thread_rng(), mode, database)
    }

    /// Pick uniformly at random among the addresses of the requested
    /// role with the fewest connections in use.
    fn select_address_with(
        &self,
        rng: &mut impl Rng,
        mode: RoutingControl,
        database: Option<&Arc<String>>,
    ) -> Result<Arc<Address>> {
        let db_key = database.map(Arc::clone);
        let rts = self.routing_tables.read();
        let addresses = rts
            .get(&db_key)
            .map(|rt| rt.servers_for_mode(mode))
            .unwrap_or(&[]);
        let mut least_used = Vec::new();
        let mut least_usage = usize::MAX;
        for address in addresses {
            let usage = self.pool.in_use_connection_count(address);
            match usage.cmp(&least_usage) {
                std::cmp::Ordering::Less => {
                    least_usage = usage;
                    least_used.clear();
                    least_used.push(address);
                }
                std::cmp::Ordering::Equal => least_used.push(address),
                std::cmp::Ordering::Greater => {}
            }
        }
        if least_used.is_empty() {
            return Err(match mode {
                RoutingControl::Read => {
                    PoolError::read_service_unavailable("no read service currently available")
                }
                RoutingControl::Write => {
                    PoolError::write_service_unavailable("no write service currently available")
                }
            });
        }
        Ok(Arc::clone(least_used[rng.gen_range(0..least_used.len())]))
    }

    /// Drop pool entries no longer referenced by the current table.
    fn prune_unused_connections(&self, database: &Option<Arc<String>>, rts: &RoutingTables) {
        let Some(rt) = rts.get(database) else {
            return;
        };
        let servers: HashSet<&Arc<Address>> = rt.servers().collect();
        for address in self.pool.addresses() {
            if !servers.contains(&address) {
                self.pool.deactivate(&address);
            }
        }
    }

    fn deactivate(&self, address: &Address) {
        drop(self.routing_tables.update(|mut rts| {
            self.deactivate_locked(address, &mut rts);
            Ok(())
        }));
    }

    fn deactivate_locked(&self, address: &Address, rts: &mut RoutingTables) {
        debug!("deactivating address {address}");
        rts.values_mut().for_each(|rt| rt.deactivate(address));
        self.pool.deactivate(address);
    }

    fn on_write_failure(&self, address: &Address) {
        debug!("removing writer {address}");
        drop(self.routing_tables.update(|mut rts| {
            rts.values_mut().for_each(|rt| rt.deactivate_writer(address));
            Ok(())
        }));
    }

    fn empty_rt(&self, database: Option<Arc<String>>) -> RoutingTable {
        RoutingTable::new(database, Arc::clone(&self.address))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::*;

    use super::*;

    #[derive(Debug, Default)]
    struct FakeConnectionState {
        closed: AtomicBool,
        defunct: AtomicBool,
        killed: AtomicBool,
    }

    #[derive(Debug)]
    struct FakeConnection {
        opener: Arc<FakeOpenerState>,
        state: Arc<FakeConnectionState>,
    }

    impl BoltConnection for FakeConnection {
        fn closed(&self) -> bool {
            self.state.closed.load(Ordering::SeqCst)
        }

        fn defunct(&self) -> bool {
            self.state.defunct.load(Ordering::SeqCst)
        }

        fn is_reset(&self) -> bool {
            true
        }

        fn is_idle_for(&self, _duration: Duration) -> bool {
            false
        }

        fn reset(&mut self, _timeout: Option<Duration>) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {
            self.state.closed.store(true, Ordering::SeqCst);
        }

        fn kill(&mut self) {
            self.state.killed.store(true, Ordering::SeqCst);
            self.state.defunct.store(true, Ordering::SeqCst);
        }

        fn route(&mut self, _parameters: RouteParameters) -> Result<Vec<RouteRecord>> {
            self.opener.route_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.opener.route_error.lock().as_ref() {
                return Err(PoolError::Server {
                    error: Box::new(error.clone()),
                });
            }
            Ok(self
                .opener
                .route_reply
                .lock()
                .iter()
                .cloned()
                .collect())
        }
    }

    #[derive(Debug, Default)]
    struct FakeOpenerState {
        route_reply: Mutex<Option<RouteRecord>>,
        route_error: Mutex<Option<ServerError>>,
        failing_addresses: Mutex<HashSet<Address>>,
        opened: Mutex<Vec<Address>>,
        route_calls: AtomicUsize,
    }

    #[derive(Debug, Clone, Default)]
    struct FakeOpener(Arc<FakeOpenerState>);

    impl FakeOpener {
        fn with_reply(record: RouteRecord) -> Self {
            let opener = Self::default();
            *opener.0.route_reply.lock() = Some(record);
            opener
        }

        fn fail_address(&self, address: &Address) {
            self.0.failing_addresses.lock().insert(address.clone());
        }

        fn route_calls(&self) -> usize {
            self.0.route_calls.load(Ordering::SeqCst)
        }

        fn open_count(&self) -> usize {
            self.0.opened.lock().len()
        }
    }

    impl ConnectionOpener for FakeOpener {
        fn open(
            &self,
            address: &Arc<Address>,
            _timeout: Option<Duration>,
        ) -> Result<Box<dyn BoltConnection>> {
            if self.0.failing_addresses.lock().contains(address) {
                return Err(PoolError::disconnect("fake open failure"));
            }
            self.0.opened.lock().push((**address).clone());
            Ok(Box::new(FakeConnection {
                opener: Arc::clone(&self.0),
                state: Arc::new(FakeConnectionState::default()),
            }))
        }
    }

    const INITIAL_ROUTER: &str = "127.0.0.1:9000";
    const ROUTER_1: &str = "127.0.0.1:9001";
    const READER_1: &str = "127.0.0.1:9002";
    const READER_2: &str = "127.0.0.1:9003";
    const WRITER_1: &str = "127.0.0.1:9004";

    fn route_server(role: &str, addresses: &[&str]) -> RouteServer {
        RouteServer {
            role: String::from(role),
            addresses: addresses.iter().map(|a| String::from(*a)).collect(),
        }
    }

    fn full_reply() -> RouteRecord {
        RouteRecord {
            servers: vec![
                route_server("ROUTE", &[ROUTER_1]),
                route_server("READ", &[READER_1, READER_2]),
                route_server("WRITE", &[WRITER_1]),
            ],
            ttl: 300,
            db: None,
        }
    }

    fn routing_pool(opener: &FakeOpener) -> Pool {
        let _ = env_logger::builder().is_test(true).try_init();
        Pool::new_routing(
            Address::from(INITIAL_ROUTER),
            Box::new(opener.clone()),
            PoolConfig::default(),
        )
    }

    fn routing_flavor(pool: &Pool) -> &RoutingPool {
        match &pool.pools {
            Pools::Routing(pool) => pool,
            Pools::Direct(_) => panic!("expected a routing pool"),
        }
    }

    fn acquire_args(mode: RoutingControl) -> AcquireConfig<'static> {
        AcquireConfig::new(mode).with_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_direct_pool_ignores_mode_and_database() {
        let opener = FakeOpener::default();
        let address = Address::from(INITIAL_ROUTER);
        let pool = Pool::new_direct(address.clone(), Box::new(opener.clone()), PoolConfig::default());
        assert!(!pool.is_routing());
        let database = Arc::new(String::from("neo4j"));
        let connection = pool
            .acquire(AcquireConfig::new(RoutingControl::Write).with_database(&database))
            .unwrap();
        assert_eq!(*connection.address(), address);
        assert_eq!(opener.route_calls(), 0);
    }

    #[test]
    fn test_direct_pool_has_no_write_service_fallback() {
        let opener = FakeOpener::default();
        let address = Address::from(INITIAL_ROUTER);
        let pool = Pool::new_direct(address.clone(), Box::new(opener), PoolConfig::default());
        assert!(matches!(
            pool.on_write_failure(&address),
            Err(PoolError::WriteServiceUnavailable { .. })
        ));
    }

    #[test]
    fn test_routing_acquire_balances_readers() {
        let opener = FakeOpener::with_reply(full_reply());
        let pool = routing_pool(&opener);
        assert!(pool.is_routing());
        let readers: HashSet<Address> =
            [READER_1, READER_2].into_iter().map(Address::from).collect();
        let connection_1 = pool.acquire(acquire_args(RoutingControl::Read)).unwrap();
        let connection_2 = pool.acquire(acquire_args(RoutingControl::Read)).unwrap();
        assert!(readers.contains(&*connection_1.address()));
        assert!(readers.contains(&*connection_2.address()));
        // the second acquisition must go to the less used reader
        assert_ne!(*connection_1.address(), *connection_2.address());
        // the table stayed fresh, so one ROUTE round-trip suffices
        assert_eq!(opener.route_calls(), 1);
    }

    #[test]
    fn test_routing_acquire_write_targets_writer() {
        let opener = FakeOpener::with_reply(full_reply());
        let pool = routing_pool(&opener);
        let connection = pool.acquire(acquire_args(RoutingControl::Write)).unwrap();
        assert_eq!(*connection.address(), Address::from(WRITER_1));
    }

    #[rstest]
    #[case(None)]
    #[case(Some(Duration::ZERO))]
    fn test_routing_acquire_validates_timeout(#[case] timeout: Option<Duration>) {
        let opener = FakeOpener::with_reply(full_reply());
        let pool = routing_pool(&opener);
        let mut args = AcquireConfig::new(RoutingControl::Read);
        args.timeout = timeout;
        assert!(matches!(
            pool.acquire(args),
            Err(PoolError::Client { .. })
        ));
        assert_eq!(opener.route_calls(), 0);
    }

    #[test]
    fn test_acquire_without_writers_is_session_expired() {
        let mut reply = full_reply();
        reply.servers.retain(|server| server.role != "WRITE");
        let opener = FakeOpener::with_reply(reply);
        let pool = routing_pool(&opener);
        let err = pool.acquire(acquire_args(RoutingControl::Write)).unwrap_err();
        assert!(matches!(err, PoolError::SessionExpired { .. }));
        // reads are still served
        drop(pool.acquire(acquire_args(RoutingControl::Read)).unwrap());
    }

    #[test]
    fn test_unreachable_routers_surface_service_unavailable() {
        let opener = FakeOpener::with_reply(full_reply());
        opener.fail_address(&Address::from(INITIAL_ROUTER));
        let pool = routing_pool(&opener);
        let err = pool.acquire(acquire_args(RoutingControl::Read)).unwrap_err();
        match err {
            PoolError::ServiceUnavailable { message, .. } => {
                assert!(message.contains("unable to retrieve routing information"));
            }
            _ => panic!("expected service unavailable, got {err:?}"),
        }
    }

    #[test]
    fn test_fatal_discovery_error_propagates() {
        let opener = FakeOpener::with_reply(full_reply());
        *opener.0.route_error.lock() = Some(ServerError::new(
            String::from("Neo.ClientError.Security.Unauthorized"),
            String::from("The client is unauthorized due to authentication failure."),
        ));
        let pool = routing_pool(&opener);
        let err = pool.acquire(acquire_args(RoutingControl::Read)).unwrap_err();
        match err {
            PoolError::Server { error } => {
                assert_eq!(error.code(), "Neo.ClientError.Security.Unauthorized");
            }
            _ => panic!("expected server error, got {err:?}"),
        }
        assert_eq!(opener.route_calls(), 1);
    }

    #[test]
    fn test_non_fatal_server_error_exhausts_routers() {
        let opener = FakeOpener::with_reply(full_reply());
        *opener.0.route_error.lock() = Some(ServerError::new(
            String::from("Neo.TransientError.General.DatabaseUnavailable"),
            String::from("The database is unavailable."),
        ));
        let pool = routing_pool(&opener);
        let err = pool.acquire(acquire_args(RoutingControl::Read)).unwrap_err();
        assert!(matches!(err, PoolError::ServiceUnavailable { .. }));
    }

    #[test]
    fn test_database_resolution_is_reported() {
        let mut reply = full_reply();
        reply.db = Some(String::from("homedb"));
        let opener = FakeOpener::with_reply(reply);
        let pool = routing_pool(&opener);
        let resolved = RefCell::new(None);
        let callback = |database: &str| {
            *resolved.borrow_mut() = Some(String::from(database));
        };
        let args = acquire_args(RoutingControl::Read).with_database_resolved_callback(&callback);
        let connection = pool.acquire(args).unwrap();
        assert_eq!(resolved.into_inner().as_deref(), Some("homedb"));
        drop(connection);
    }

    #[test]
    fn test_deactivate_prunes_routing_tables_and_pool() {
        let opener = FakeOpener::with_reply(full_reply());
        let pool = routing_pool(&opener);
        let connection = pool.acquire(acquire_args(RoutingControl::Read)).unwrap();
        let reader = connection.address();
        drop(connection);
        pool.deactivate(&reader);
        let routing = routing_flavor(&pool);
        let rts = routing.routing_tables.read();
        assert!(rts.values().all(|rt| rt.servers().all(|a| **a != *reader)));
        drop(rts);
        assert_eq!(routing.pool.connection_counts(&reader), (0, 0));
    }

    #[test]
    fn test_write_failure_removes_writer_until_update() {
        let opener = FakeOpener::with_reply(full_reply());
        let pool = routing_pool(&opener);
        drop(pool.acquire(acquire_args(RoutingControl::Write)).unwrap());
        pool.on_write_failure(&Address::from(WRITER_1)).unwrap();
        let routing = routing_flavor(&pool);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            routing.select_address_with(&mut rng, RoutingControl::Write, None),
            Err(PoolError::WriteServiceUnavailable { .. })
        ));
        // readers are untouched
        assert!(routing
            .select_address_with(&mut rng, RoutingControl::Read, None)
            .is_ok());
        // the next write acquisition refreshes the table and recovers
        let connection = pool.acquire(acquire_args(RoutingControl::Write)).unwrap();
        assert_eq!(*connection.address(), Address::from(WRITER_1));
        assert_eq!(opener.route_calls(), 2);
    }

    #[test]
    fn test_select_address_prefers_least_used() {
        let opener = FakeOpener::with_reply(full_reply());
        let pool = routing_pool(&opener);
        let connection = pool.acquire(acquire_args(RoutingControl::Read)).unwrap();
        let busy = connection.address();
        let routing = routing_flavor(&pool);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10 {
            let selected = routing
                .select_address_with(&mut rng, RoutingControl::Read, None)
                .unwrap();
            assert_ne!(*selected, *busy);
        }
    }

    #[test]
    fn test_aged_routing_tables_are_purged() {
        let opener = FakeOpener::with_reply(full_reply());
        let pool = routing_pool(&opener);
        let routing = routing_flavor(&pool);
        let aged_db = Some(Arc::new(String::from("aged")));
        drop(routing.routing_tables.update(|mut rts| {
            let mut table = routing.empty_rt(aged_db.clone());
            table.last_updated_time = table
                .last_updated_time
                .checked_sub(Duration::from_secs(31))
                .unwrap();
            rts.insert(aged_db.clone(), table);
            Ok(())
        }));
        drop(pool.acquire(acquire_args(RoutingControl::Read)).unwrap());
        assert!(!routing.routing_tables.read().contains_key(&aged_db));
    }

    #[test]
    fn test_server_error_hooks() {
        let opener = FakeOpener::with_reply(full_reply());
        let pool = routing_pool(&opener);
        drop(pool.acquire(acquire_args(RoutingControl::Read)).unwrap());
        let routing = routing_flavor(&pool);

        let not_a_leader = ServerError::new(
            String::from("Neo.ClientError.Cluster.NotALeader"),
            String::from("No longer the leader."),
        );
        pool.on_server_error(&Address::from(WRITER_1), &not_a_leader);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(routing
            .select_address_with(&mut rng, RoutingControl::Write, None)
            .is_err());

        let unavailable = ServerError::new(
            String::from("Neo.TransientError.General.DatabaseUnavailable"),
            String::from("The database is unavailable."),
        );
        pool.on_server_error(&Address::from(READER_1), &unavailable);
        let rts = routing.routing_tables.read();
        let reader = Address::from(READER_1);
        assert!(rts.values().all(|rt| rt.servers().all(|a| **a != reader)));
    }

    #[test]
    fn test_mark_all_stale_forces_new_connections() {
        let opener = FakeOpener::with_reply(full_reply());
        let pool = routing_pool(&opener);
        let connection = pool.acquire(acquire_args(RoutingControl::Write)).unwrap();
        let writer = connection.address();
        drop(connection);
        let opens_before = opener.open_count();
        pool.mark_all_stale();
        drop(pool.acquire(acquire_args(RoutingControl::Write)).unwrap());
        assert_eq!(*pool.acquire(acquire_args(RoutingControl::Write)).unwrap().address(), *writer);
        assert!(opener.open_count() > opens_before);
    }
}
