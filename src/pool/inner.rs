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

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atomic_refcell::AtomicRefCell;
use log::debug;
use parking_lot::lock_api::MutexGuard;
use parking_lot::{Condvar, Mutex, RawMutex};

use super::bolt::{BoltConnection, ConnectionOpener, RouteParameters, RouteRecord};
use super::PoolConfig;
use crate::address_::Address;
use crate::deadline::Deadline;
use crate::error_::{PoolError, Result};

type Bucket = Vec<Arc<TrackedConnection>>;

/// The pool core shared by the direct and the routing flavor: connections
/// to any number of addresses, a reservation count per address for
/// connections that are still being opened, and a condition to park
/// acquisitions on while the pool is at capacity.
#[derive(Debug)]
pub(crate) struct InnerPool {
    config: Arc<PoolConfig>,
    opener: Box<dyn ConnectionOpener>,
    synced: Mutex<SyncedPoolData>,
    made_room_condition: Condvar,
}

#[derive(Debug, Default)]
struct SyncedPoolData {
    connections: HashMap<Arc<Address>, Bucket>,
    reservations: HashMap<Arc<Address>, usize>,
}

/// A connection as the pool tracks it.
///
/// The `in_use` and `stale` flags belong to the pool and are only
/// mutated while holding the pool lock; the `io` cell is borrowed
/// exclusively by whoever checked the connection out.
#[derive(Debug)]
pub(crate) struct TrackedConnection {
    address: Arc<Address>,
    io: AtomicRefCell<Box<dyn BoltConnection>>,
    in_use: AtomicBool,
    stale: AtomicBool,
}

impl TrackedConnection {
    pub(crate) fn address(&self) -> &Arc<Address> {
        &self.address
    }

    pub(crate) fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::SeqCst)
    }

    pub(crate) fn stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    fn set_stale(&self) {
        self.stale.store(true, Ordering::SeqCst)
    }
}

impl InnerPool {
    fn acquire_from_pool(&self, address: &Address) -> Option<Arc<TrackedConnection>> {
        let synced = self.synced.lock();
        let bucket = synced.connections.get(address)?;
        for connection in bucket {
            if !connection.in_use() {
                connection.set_in_use(true);
                return Some(Arc::clone(connection));
            }
        }
        None
    }

    fn health_check(
        &self,
        connection: &TrackedConnection,
        deadline: Deadline,
        liveness_check_timeout: Option<Duration>,
    ) -> bool {
        if connection.stale() {
            return false;
        }
        {
            let io = connection.io.borrow();
            if io.closed() || io.defunct() {
                return false;
            }
            if let Some(max_lifetime) = self.config.max_connection_lifetime {
                if io.is_idle_for(max_lifetime) {
                    debug!("connection to {} reached max lifetime", connection.address);
                    return false;
                }
            }
        }
        if let Some(timeout) = liveness_check_timeout {
            let mut io = connection.io.borrow_mut();
            if io.is_idle_for(timeout) {
                debug!("liveness check for connection to {}", connection.address);
                if let Err(err) = io.reset(deadline.to_timeout()) {
                    debug!("liveness check failed: {err}");
                    return false;
                }
            }
        }
        true
    }

    fn has_room(&self, address: &Address, synced: &SyncedPoolData) -> bool {
        match self.config.max_connection_pool_size {
            None => true,
            Some(max_pool_size) => {
                let pool_size = synced.connections.get(address).map(Vec::len).unwrap_or(0)
                    + synced.reservations.get(address).copied().unwrap_or(0);
                pool_size < max_pool_size
            }
        }
    }

    fn reserve(address: &Arc<Address>, synced: &mut SyncedPoolData) {
        *synced.reservations.entry(Arc::clone(address)).or_insert(0) += 1;
    }

    fn unreserve(address: &Address, synced: &mut SyncedPoolData) {
        match synced.reservations.get_mut(address) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                synced.reservations.remove(address);
            }
            None => debug_assert!(false, "released a reservation that was never taken"),
        }
    }

    pub(crate) fn release(inner_pool: &Arc<InnerPool>, connection: &Arc<TrackedConnection>) {
        let needs_reset = {
            let io = connection.io.borrow();
            !(io.closed() || io.defunct() || io.is_reset())
        };
        if needs_reset {
            debug!("released unclean connection to {}", connection.address);
            if let Err(err) = connection.io.borrow_mut().reset(None) {
                debug!("failed to reset connection on release: {err}");
            }
        }
        let discarded = {
            let mut synced = inner_pool.synced.lock();
            connection.set_in_use(false);
            let pooled = synced
                .connections
                .get(&connection.address)
                .map(|bucket| bucket.iter().any(|tracked| Arc::ptr_eq(tracked, connection)))
                .unwrap_or(false);
            inner_pool.made_room_condition.notify_all();
            !pooled
        };
        if discarded {
            // the address was deactivated while the connection was handed out
            debug!("discarding released connection to {}", connection.address);
            let mut io = connection.io.borrow_mut();
            if !io.closed() {
                io.close();
            }
        }
    }

    pub(crate) fn kill_and_release(
        inner_pool: &Arc<InnerPool>,
        connection: &Arc<TrackedConnection>,
    ) {
        {
            let mut io = connection.io.borrow_mut();
            if !(io.defunct() || io.closed()) {
                debug!("killing connection to {} on release", connection.address);
                io.kill();
            }
        }
        let mut synced = inner_pool.synced.lock();
        connection.set_in_use(false);
        inner_pool.made_room_condition.notify_all();
    }

    fn close_connections(connections: &[Arc<TrackedConnection>]) {
        for connection in connections {
            match connection.io.try_borrow_mut() {
                Ok(mut io) => {
                    if !io.closed() {
                        io.close();
                    }
                }
                // the holder is mid-operation; flag the connection so the
                // next health check retires it
                Err(_) => connection.set_stale(),
            }
        }
    }
}

/// Handle on the pool core, cheap to share with connection guards.
#[derive(Debug)]
pub(crate) struct ConnectionPool(Arc<InnerPool>);

impl ConnectionPool {
    pub(crate) fn new(opener: Box<dyn ConnectionOpener>, config: Arc<PoolConfig>) -> Self {
        Self(Arc::new(InnerPool {
            config,
            opener,
            synced: Mutex::new(SyncedPoolData::default()),
            made_room_condition: Condvar::new(),
        }))
    }

    /// Acquire an exclusive, live, reset connection to `address`,
    /// reusing an idle one, opening a new one while there is room, or
    /// waiting for room until the deadline expires.
    ///
    /// The address should already be fully resolved.
    pub(crate) fn acquire(
        &self,
        address: &Arc<Address>,
        deadline: Deadline,
        liveness_check_timeout: Option<Duration>,
    ) -> Result<PooledConnection> {
        loop {
            if let Some(connection) =
                self.acquire_from_pool_checked(address, deadline, liveness_check_timeout)
            {
                debug!("handing out existing connection to {address}");
                return Ok(PooledConnection::new(connection, Arc::clone(&self.0)));
            }
            let mut synced = self.0.synced.lock();
            if self.0.has_room(address, &synced) {
                InnerPool::reserve(address, &mut synced);
                drop(synced);
                debug!("trying to hand out new connection to {address}");
                return self.acquire_new(address, deadline);
            }
            self.wait_for_room(deadline, &mut synced)?;
        }
    }

    fn acquire_from_pool_checked(
        &self,
        address: &Arc<Address>,
        deadline: Deadline,
        liveness_check_timeout: Option<Duration>,
    ) -> Option<Arc<TrackedConnection>> {
        while !deadline.expired() {
            let connection = self.0.acquire_from_pool(address)?;
            if self
                .0
                .health_check(&connection, deadline, liveness_check_timeout)
            {
                return Some(connection);
            }
            // Close gracefully even if the connection is merely marked
            // stale, i.e., possibly still alive.
            {
                let mut io = connection.io.borrow_mut();
                debug!(
                    "removing old connection to {address} (closed={}, defunct={}, stale={})",
                    io.closed(),
                    io.defunct(),
                    connection.stale(),
                );
                io.close();
            }
            let mut synced = self.0.synced.lock();
            if let Some(bucket) = synced.connections.get_mut(address.as_ref()) {
                bucket.retain(|tracked| !Arc::ptr_eq(tracked, &connection));
                if bucket.is_empty() {
                    synced.connections.remove(address.as_ref());
                }
            }
        }
        None
    }

    fn acquire_new(&self, address: &Arc<Address>, deadline: Deadline) -> Result<PooledConnection> {
        let reservation = ReservationGuard::new(&self.0, address);
        match self.0.opener.open(address, deadline.to_timeout()) {
            Ok(io) => {
                let connection = Arc::new(TrackedConnection {
                    address: Arc::clone(address),
                    io: AtomicRefCell::new(io),
                    in_use: AtomicBool::new(true),
                    stale: AtomicBool::new(false),
                });
                let mut synced = self.0.synced.lock();
                reservation.fulfill(&mut synced);
                synced
                    .connections
                    .entry(Arc::clone(address))
                    .or_default()
                    .push(Arc::clone(&connection));
                drop(synced);
                Ok(PooledConnection::new(connection, Arc::clone(&self.0)))
            }
            Err(err) => {
                // frees the reservation and wakes waiters
                drop(reservation);
                if matches!(err, PoolError::ServiceUnavailable { .. }) {
                    self.deactivate(address);
                }
                Err(err)
            }
        }
    }

    fn wait_for_room(
        &self,
        deadline: Deadline,
        synced: &mut MutexGuard<RawMutex, SyncedPoolData>,
    ) -> Result<()> {
        match deadline.instant() {
            None => {
                self.0.made_room_condition.wait(synced);
                Ok(())
            }
            Some(instant) => {
                if deadline.expired()
                    || self
                        .0
                        .made_room_condition
                        .wait_until(synced, instant.raw())
                        .timed_out()
                {
                    debug!("acquisition timed out");
                    return Err(PoolError::acquisition_timeout(deadline.original_timeout()));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn in_use_connection_count(&self, address: &Address) -> usize {
        let synced = self.0.synced.lock();
        synced
            .connections
            .get(address)
            .map(|bucket| bucket.iter().filter(|c| c.in_use()).count())
            .unwrap_or(0)
    }

    /// `(in_use, idle)` counts for the given address.
    pub(crate) fn connection_counts(&self, address: &Address) -> (usize, usize) {
        let synced = self.0.synced.lock();
        let Some(bucket) = synced.connections.get(address) else {
            return (0, 0);
        };
        let in_use = bucket.iter().filter(|c| c.in_use()).count();
        (in_use, bucket.len() - in_use)
    }

    pub(crate) fn addresses(&self) -> Vec<Arc<Address>> {
        self.0.synced.lock().connections.keys().cloned().collect()
    }

    /// Close all idle connections to `address` and forget the address
    /// unless connections to it are still handed out.
    pub(crate) fn deactivate(&self, address: &Address) {
        let closable_connections = {
            let mut synced = self.0.synced.lock();
            let Some(bucket) = synced.connections.get_mut(address) else {
                return;
            };
            let closable: Vec<_> = bucket
                .iter()
                .filter(|connection| !connection.in_use())
                .cloned()
                .collect();
            // Remove all connections in question first, then close them
            // with the lock released.
            bucket.retain(|connection| connection.in_use());
            if bucket.is_empty() {
                synced.connections.remove(address);
            }
            closable
        };
        InnerPool::close_connections(&closable_connections);
    }

    /// Make every pooled connection fail its next health check.
    pub(crate) fn mark_all_stale(&self) {
        let synced = self.0.synced.lock();
        for bucket in synced.connections.values() {
            for connection in bucket {
                connection.set_stale();
            }
        }
    }

    /// Close all connections and empty the pool. Idempotent.
    pub(crate) fn close(&self) {
        debug!("closing pool");
        let connections: Vec<_> = {
            let mut synced = self.0.synced.lock();
            synced
                .connections
                .drain()
                .flat_map(|(_, bucket)| bucket)
                .collect()
        };
        InnerPool::close_connections(&connections);
    }

    #[cfg(test)]
    fn inner(&self) -> &Arc<InnerPool> {
        &self.0
    }
}

/// Counted placeholder for an in-flight open, so that
/// `bucket length + reservations` stays a tight bound on the eventual
/// pool size. Released on every exit path; dropping it without
/// fulfilling counts as a failed open and wakes waiters.
struct ReservationGuard<'pool> {
    pool: &'pool InnerPool,
    address: &'pool Arc<Address>,
    armed: bool,
}

impl<'pool> ReservationGuard<'pool> {
    fn new(pool: &'pool InnerPool, address: &'pool Arc<Address>) -> Self {
        Self {
            pool,
            address,
            armed: true,
        }
    }

    fn fulfill(mut self, synced: &mut SyncedPoolData) {
        InnerPool::unreserve(self.address, synced);
        self.armed = false;
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut synced = self.pool.synced.lock();
        InnerPool::unreserve(self.address, &mut synced);
        self.pool.made_room_condition.notify_all();
    }
}

/// An exclusively owned connection checked out of a pool.
///
/// Dropping the guard returns the connection to its pool: the protocol
/// state is reset best-effort, the connection becomes available for
/// reuse, and waiters are woken. Use [`PooledConnection::kill_and_release`]
/// for connections known to be unrecoverable.
#[derive(Debug)]
pub struct PooledConnection {
    pool: Arc<InnerPool>,
    connection: Option<Arc<TrackedConnection>>,
    kill_on_release: bool,
}

impl PooledConnection {
    fn new(connection: Arc<TrackedConnection>, pool: Arc<InnerPool>) -> Self {
        Self {
            pool,
            connection: Some(connection),
            kill_on_release: false,
        }
    }

    /// The resolved address this connection is bound to.
    pub fn address(&self) -> Arc<Address> {
        Arc::clone(self.tracked().address())
    }

    /// Run an operation against the underlying connection object.
    pub fn with_connection<R>(&mut self, work: impl FnOnce(&mut dyn BoltConnection) -> R) -> R {
        let mut io = self.tracked().io.borrow_mut();
        work(io.as_mut())
    }

    /// Issue a ROUTE request on this connection.
    pub fn route(&mut self, parameters: RouteParameters) -> Result<Vec<RouteRecord>> {
        self.with_connection(|connection| connection.route(parameters))
    }

    /// Forcefully tear the connection down and return it to the pool.
    pub fn kill_and_release(mut self) {
        self.kill_on_release = true;
    }

    pub(crate) fn tracked(&self) -> &Arc<TrackedConnection> {
        self.connection
            .as_ref()
            .expect("connection is Some from init to drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let connection = self
            .connection
            .take()
            .expect("connection is Some from init to drop");
        if self.kill_on_release {
            InnerPool::kill_and_release(&self.pool, &connection);
        } else {
            InnerPool::release(&self.pool, &connection);
        }
    }
}
