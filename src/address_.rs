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

pub(crate) mod resolution;

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::io::Result as IoResult;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::vec::IntoIter;

use log::debug;

use crate::error_::Result;
use resolution::AddressResolver;

pub(crate) const DEFAULT_PORT: u16 = 7687;

/// A server address.
///
/// Can be constructed from `(&str, u16)`, `(String, u16)`, a
/// [`SocketAddr`], or a `&str` of the form `"host"`, `"host:port"`,
/// `"127.0.0.1:7687"`, or `"[::1]:7687"`.
/// When no port is given, the default port 7687 is assumed.
#[derive(Debug, Clone)]
pub struct Address {
    host: String,
    port: u16,
    /// The identity connections are pooled under: the canonicalized
    /// host name from before any DNS lookup. Stays put when DNS
    /// resolution swaps `host` for an IP address, so that all
    /// connections derived from one configured or routed address end
    /// up in the same bucket.
    pool_key: String,
    /// Set on addresses a custom [`AddressResolver`] produced, so they
    /// are not fed through the resolver a second time.
    custom_resolved: bool,
}

impl Address {
    fn new_unresolved(host: String, port: u16) -> Self {
        // IP literals come in many spellings; canonicalize the key so
        // "127.0.0.1" and "127.000.000.001" share a bucket
        let pool_key = match IpAddr::from_str(&host) {
            Ok(ip) => ip.to_string(),
            Err(_) => host.clone(),
        };
        Self {
            host,
            port,
            pool_key,
            custom_resolved: false,
        }
    }

    fn is_ip_literal(&self) -> bool {
        IpAddr::from_str(&self.host).is_ok()
    }

    fn with_resolved_ip(&self, socket_address: SocketAddr) -> Self {
        Self {
            host: socket_address.ip().to_string(),
            port: socket_address.port(),
            pool_key: self.pool_key.clone(),
            custom_resolved: self.custom_resolved,
        }
    }

    /// Expand the address through the custom resolver (if any), then
    /// through DNS, yielding fully resolved addresses one at a time.
    pub(crate) fn fully_resolve(
        self: Arc<Self>,
        resolver: Option<&dyn AddressResolver>,
    ) -> Result<impl Iterator<Item = IoResult<Arc<Self>>>> {
        Ok(resolution::custom_resolve(self, resolver)?
            .into_iter()
            .flat_map(Self::resolve_dns))
    }

    /// Look the host name up via DNS.
    ///
    /// Addresses that already carry an IP literal are passed through
    /// untouched; a failed lookup is reported as the single yielded
    /// item.
    pub(crate) fn resolve_dns(self: Arc<Self>) -> IntoIter<IoResult<Arc<Self>>> {
        if self.is_ip_literal() {
            return vec![Ok(self)].into_iter();
        }
        debug!("dns resolving {self}");
        let resolved = match self.to_socket_addrs() {
            Ok(addresses) => addresses
                .map(|socket_address| Ok(Arc::new(self.with_resolved_ip(socket_address))))
                .collect::<Vec<_>>(),
            Err(err) => {
                debug!("dns resolution of {self} failed: {err}");
                vec![Err(err)]
            }
        };
        resolved.into_iter()
    }

    /// Return the host name or IP address.
    ///
    /// For addresses that have been resolved by the pool, this is the
    /// final IP address after custom and DNS resolution.
    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    /// Return the port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the host name before any DNS resolution.
    ///
    /// Connections are keyed by this host name, so that a routing table
    /// entry (unresolved) matches the pool entries opened against the
    /// IP addresses it resolved to.
    pub fn unresolved_host(&self) -> &str {
        &self.pool_key
    }
}

/// Note that equality of addresses is defined as equality of its
/// [`Address::unresolved_host()`] and [`Address::port()`] only.
/// Therefore, different IP addresses resolved from the same host are
/// considered equal if their port is equal as well.
impl PartialEq for Address {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        (&self.pool_key, self.port) == (&other.pool_key, other.port)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (&self.pool_key, self.port).hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.host.contains(':') {
            true => write!(f, "[{}]:{}", self.host, self.port),
            false => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Split `"host:port"`, falling back to the default port when no (or an
/// unparsable) port is present. Bare IPv6 addresses keep all their
/// colons; a port can be appended to them in bracket notation.
fn split_host_port(value: &str) -> (&str, u16) {
    let Some((host, port)) = value.rsplit_once(':') else {
        return (value, DEFAULT_PORT);
    };
    if host.contains(':') && !host.ends_with(']') {
        // bare IPv6, the "port" was just its last segment
        return (value, DEFAULT_PORT);
    }
    match port.parse() {
        Ok(port) => (host, port),
        Err(_) => (host, DEFAULT_PORT),
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        let (host, port) = split_host_port(value);
        Self::new_unresolved(String::from(host), port)
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Self {
        Self::new_unresolved(host, port)
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new_unresolved(String::from(host), port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new_unresolved(addr.ip().to_string(), addr.port())
    }
}

impl ToSocketAddrs for Address {
    type Iter = IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}
