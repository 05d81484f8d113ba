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

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::sleep;
use std::time::Duration;

use crate::Result;

/// How long losers of the update race sleep before rechecking.
const UPDATE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Lock for read-mostly data that is expensive to refresh.
///
/// Readers share a plain `RwLock`. At most one caller at a time gets to
/// run an update; everyone else who finds the data stale sleeps and
/// rechecks once the winner is done, rather than queueing up behind the
/// write lock only to redo the same refresh.
#[derive(Debug)]
pub(crate) struct ReadMostlyLock<T: Debug> {
    data: RwLock<T>,
    update_claimed: AtomicBool,
}

/// Exclusive permission to run an update. Handing it back on drop keeps
/// the claim from getting stuck when an update fails.
struct UpdateClaim<'lock>(&'lock AtomicBool);

impl<'lock> UpdateClaim<'lock> {
    fn try_take(claimed: &'lock AtomicBool) -> Option<Self> {
        match claimed.swap(true, Ordering::SeqCst) {
            false => Some(Self(claimed)),
            true => None,
        }
    }
}

impl Drop for UpdateClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T: Debug> ReadMostlyLock<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            data: RwLock::new(data),
            update_claimed: AtomicBool::new(false),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, T> {
        self.data.read().unwrap()
    }

    /// Run `updater` exclusively and hand back a read guard on the
    /// result.
    pub(crate) fn update<'a>(
        &'a self,
        updater: impl FnMut(RwLockWriteGuard<'a, T>) -> Result<()>,
    ) -> Result<RwLockReadGuard<'a, T>> {
        self.maybe_write(|_| true, updater)
    }

    /// Run `updater` exclusively if `needs_update` says so, then hand
    /// back a read guard on the (possibly refreshed) data.
    ///
    /// `needs_update` may run any number of times, `updater` at most
    /// once per call.
    pub(crate) fn maybe_write<'a>(
        &'a self,
        mut needs_update: impl FnMut(&T) -> bool,
        mut updater: impl FnMut(RwLockWriteGuard<'a, T>) -> Result<()>,
    ) -> Result<RwLockReadGuard<'a, T>> {
        loop {
            {
                let data = self.data.read().unwrap();
                if !needs_update(&data) {
                    return Ok(data);
                }
            }
            let Some(claim) = UpdateClaim::try_take(&self.update_claimed) else {
                // somebody else is already refreshing; don't pile up on
                // the write lock, recheck once they are done
                sleep(UPDATE_RETRY_INTERVAL);
                continue;
            };
            updater(self.data.write().unwrap())?;
            drop(claim);
            return Ok(self.data.read().unwrap());
        }
    }
}
