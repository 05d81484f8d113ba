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

use std::error::Error as StdError;
use std::fmt::Debug;
use std::result::Result as StdResult;
use std::sync::Arc;

use log::debug;

use super::Address;
use crate::error_::{PoolError, Result, UserCallbackError};

type BoxError = Box<dyn StdError + Send + Sync>;
/// See [`AddressResolver::resolve()`].
pub type AddressResolverReturn = StdResult<Vec<Address>, BoxError>;

/// A trait for custom address resolution.
///
/// The resolver is consulted while updating routing tables, before DNS
/// resolution takes place. It is never applied to direct connections,
/// whose address is taken as configured.
pub trait AddressResolver: Debug + Send + Sync {
    /// An empty result marks the address as unresolvable; the routing
    /// update then moves on to the next router.
    fn resolve(&self, address: &Address) -> AddressResolverReturn;
}

/// Feed `address` through the custom resolver, marking the output so it
/// does not get resolved a second time. Without a resolver (or for
/// addresses the resolver already produced) the address passes through
/// untouched.
pub(crate) fn custom_resolve(
    address: Arc<Address>,
    resolver: Option<&dyn AddressResolver>,
) -> Result<Vec<Arc<Address>>> {
    let Some(resolver) = resolver else {
        return Ok(vec![address]);
    };
    if address.custom_resolved {
        return Ok(vec![address]);
    }
    debug!("custom resolving {address}");
    match resolver.resolve(&address) {
        Ok(resolved) => {
            let resolved = resolved
                .into_iter()
                .map(|mut resolved_address| {
                    resolved_address.custom_resolved = true;
                    Arc::new(resolved_address)
                })
                .collect::<Vec<_>>();
            debug!(
                "custom resolution of {address} yielded {:?}",
                resolved.iter().map(|a| format!("{a}")).collect::<Vec<_>>()
            );
            Ok(resolved)
        }
        Err(err) => {
            debug!("custom resolution of {address} failed: {err:?}");
            Err(PoolError::UserCallback {
                error: UserCallbackError::Resolver(err),
            })
        }
    }
}
