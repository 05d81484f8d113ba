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

use std::time::Duration;

use crate::time::Instant;

/// A point in time until which an acquisition may keep trying, plus the
/// timeout it was derived from (for error reporting).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    instant: Option<Instant>,
    original_timeout: Option<Duration>,
}

impl Deadline {
    pub(crate) fn from_timeout(timeout: Duration) -> Self {
        Self {
            instant: Some(Instant::now() + timeout),
            original_timeout: Some(timeout),
        }
    }

    pub(crate) fn unbounded() -> Self {
        Self {
            instant: None,
            original_timeout: None,
        }
    }

    pub(crate) fn from_timeout_opt(timeout: Option<Duration>) -> Self {
        timeout.map(Self::from_timeout).unwrap_or_else(Self::unbounded)
    }

    pub(crate) fn instant(&self) -> Option<Instant> {
        self.instant
    }

    pub(crate) fn original_timeout(&self) -> Option<Duration> {
        self.original_timeout
    }

    /// An unbounded deadline never expires.
    pub(crate) fn expired(&self) -> bool {
        self.instant
            .map(|instant| Instant::now() >= instant)
            .unwrap_or(false)
    }

    /// Remaining time, saturating at zero once expired.
    /// `None` means unbounded.
    pub(crate) fn to_timeout(&self) -> Option<Duration> {
        self.instant.map(|instant| {
            instant
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO)
        })
    }
}
