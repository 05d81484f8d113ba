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

//! # Bolt Connection Pool
//!
//! The connection-pool and routing core of a Bolt client driver:
//! session-layer code asks a [`Pool`] for a live, healthy, exclusively
//! owned connection directed at an appropriate server, subject to role
//! (read/write), database, deadline, and liveness constraints. The pool
//! keeps itself coherent with a dynamically changing cluster topology
//! by maintaining per-database routing tables with a ttl.
//!
//! What a connection *is* stays abstract: callers inject a
//! [`ConnectionOpener`] producing [`BoltConnection`] objects, and the
//! pool opens, health-checks, hands out, and retires them. Bolt message
//! framing, cypher handling, and transaction orchestration live in the
//! layers around this crate.
//!
//! ## Flavors
//!
//! * [`Pool::new_direct()`]: all connections go to one fixed address.
//! * [`Pool::new_routing()`]: acquisitions are routed by role across
//!   the cluster described by the routing table, which is refreshed
//!   through ROUTE requests whenever it goes stale.
//!
//! Acquired connections are returned as [`PooledConnection`] guards
//! that release themselves back into the pool on drop.
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade, mostly at `DEBUG` level.
//! Routing decisions, health-check rejections, and discovery errors can
//! all be traced this way.
//!
//! [`Pool`]: crate::pool::Pool
//! [`Pool::new_direct()`]: crate::pool::Pool::new_direct
//! [`Pool::new_routing()`]: crate::pool::Pool::new_routing
//! [`PooledConnection`]: crate::pool::PooledConnection
//! [`ConnectionOpener`]: crate::pool::ConnectionOpener
//! [`BoltConnection`]: crate::pool::BoltConnection

mod address_;
mod bookmarks_;
mod deadline;
mod error_;
pub mod pool;
mod sync;
mod time;

pub use error_::{PoolError, Result};
pub use pool::{Pool, PoolConfig, RoutingControl};

/// Addresses and address resolution.
pub mod address {
    pub use super::address_::resolution::*;
    pub use super::address_::*;
}

/// Bookmarks for causally consistent routing.
pub mod bookmarks {
    pub use super::bookmarks_::*;
}

/// Error and result types.
pub mod error {
    pub use super::error_::{ServerError, UserCallbackError};
}
