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

//! The contracts between the pool and the connection objects it manages.
//! The pool treats connections opaquely: it opens them through a
//! [`ConnectionOpener`], health-checks them through the predicates below,
//! and closes them when they are retired.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::address_::Address;
use crate::bookmarks::Bookmarks;
use crate::error_::Result;

/// An open Bolt session as the pool sees it.
///
/// The health predicates `closed` and `defunct` are monotonic: once they
/// report `true`, they keep doing so for the rest of the connection's
/// life.
pub trait BoltConnection: Debug + Send + Sync {
    /// Whether the connection has been (gracefully) closed.
    fn closed(&self) -> bool;

    /// Whether the connection died (e.g., the transport broke).
    fn defunct(&self) -> bool;

    /// Whether the connection is in clean protocol state: no in-flight
    /// failure and no unacknowledged messages.
    fn is_reset(&self) -> bool;

    /// Whether the connection has seen no activity for at least the
    /// given duration.
    fn is_idle_for(&self, duration: Duration) -> bool;

    /// Perform a protocol RESET round-trip, bounded by `timeout` when
    /// one is given.
    fn reset(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Close the connection gracefully.
    /// Must be a no-op on an already closed connection.
    fn close(&mut self);

    /// Tear the connection down forcefully. Must not block.
    fn kill(&mut self);

    /// Issue a ROUTE request and return the reply records.
    fn route(&mut self, parameters: RouteParameters) -> Result<Vec<RouteRecord>>;
}

/// Injected constructor for new connections.
///
/// Must fail with [`PoolError::ServiceUnavailable`] when the transport
/// cannot be established and with [`PoolError::Client`] on unrecoverable
/// protocol-level misconfiguration (e.g., authentication or TLS).
///
/// [`PoolError::ServiceUnavailable`]: crate::PoolError::ServiceUnavailable
/// [`PoolError::Client`]: crate::PoolError::Client
pub trait ConnectionOpener: Debug + Send + Sync {
    fn open(
        &self,
        address: &Arc<Address>,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn BoltConnection>>;
}

/// Parameters of a ROUTE request.
#[derive(Debug, Copy, Clone)]
pub struct RouteParameters<'a> {
    pub database: Option<&'a str>,
    pub impersonated_user: Option<&'a str>,
    pub bookmarks: Option<&'a Bookmarks>,
}

impl<'a> RouteParameters<'a> {
    pub(crate) fn new(
        database: Option<&'a str>,
        impersonated_user: Option<&'a str>,
        bookmarks: Option<&'a Bookmarks>,
    ) -> Self {
        Self {
            database,
            impersonated_user,
            bookmarks,
        }
    }
}

/// A single record of a ROUTE reply.
#[derive(Debug, Clone)]
pub struct RouteRecord {
    /// The servers of the cluster, grouped by role.
    pub servers: Vec<RouteServer>,
    /// How long the reply may be cached, in seconds.
    pub ttl: i64,
    /// The database the reply applies to, as reported by the server.
    /// May differ from the requested database when the request left it
    /// to the server to pick one.
    pub db: Option<String>,
}

/// One `{role, addresses}` entry of a ROUTE reply.
#[derive(Debug, Clone)]
pub struct RouteServer {
    /// `"ROUTE"`, `"READ"`, or `"WRITE"`.
    pub role: String,
    pub addresses: Vec<String>,
}
