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
use std::fmt::{Display, Formatter};
use std::io;
use std::time::Duration;

use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors surfaced by the connection pool.
///
/// **Important Notes on Usage:**
///  * Error messages are *not* considered part of the crate's API.
///    They may change at any time and don't follow semantic versioning.
///  * The only somewhat reliable string is [`ServerError::code()`],
///    which is received from the server as-is.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PoolError {
    /// Used when
    ///  * a server could not be reached over the network,
    ///  * an established connection broke, or
    ///  * no router was able to provide routing information.
    #[error("connection failed: {message}{}",
            source.as_ref().map(|err| format!(" caused by: {err}")).unwrap_or_default())]
    #[non_exhaustive]
    ServiceUnavailable {
        message: String,
        source: Option<io::Error>,
    },

    /// Used when the selected server can no longer serve the requested
    /// role (e.g., a writer that has been demoted) and the caller should
    /// retry against a fresh routing table.
    #[error("session expired: {message}")]
    #[non_exhaustive]
    SessionExpired { message: String },

    /// Used when the pool is misused (e.g., a non-positive acquisition
    /// timeout) or exhausted within the acquisition deadline.
    #[error("{message}")]
    #[non_exhaustive]
    Client { message: String },

    /// Used when the routing table holds no server that can serve reads.
    #[error("{message}")]
    #[non_exhaustive]
    ReadServiceUnavailable { message: String },

    /// Used when the routing table holds no server that can serve writes.
    #[error("{message}")]
    #[non_exhaustive]
    WriteServiceUnavailable { message: String },

    /// Used when the server returned an error.
    #[error("{error}")]
    #[non_exhaustive]
    Server { error: Box<ServerError> },

    /// Used when a user-provided callback failed.
    #[error("{error}")]
    #[non_exhaustive]
    UserCallback { error: UserCallbackError },

    /// An unexpected message or message content was received from the
    /// server (e.g., a malformed ROUTE reply).
    #[error("protocol violation: {message}")]
    #[non_exhaustive]
    Protocol { message: String },
}

impl PoolError {
    pub(crate) fn disconnect<S: Into<String>>(message: S) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
            source: None,
        }
    }

    #[allow(dead_code)] // part of the opener contract, exercised by opener implementations
    pub(crate) fn connect_error(err: io::Error) -> Self {
        Self::ServiceUnavailable {
            message: String::from("failed to open connection"),
            source: Some(err),
        }
    }

    pub(crate) fn client_error<S: Into<String>>(message: S) -> Self {
        Self::Client {
            message: message.into(),
        }
    }

    pub(crate) fn session_expired<S: Into<String>>(message: S) -> Self {
        Self::SessionExpired {
            message: message.into(),
        }
    }

    pub(crate) fn read_service_unavailable<S: Into<String>>(message: S) -> Self {
        Self::ReadServiceUnavailable {
            message: message.into(),
        }
    }

    pub(crate) fn write_service_unavailable<S: Into<String>>(message: S) -> Self {
        Self::WriteServiceUnavailable {
            message: message.into(),
        }
    }

    pub(crate) fn protocol_error<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn acquisition_timeout(original_timeout: Option<Duration>) -> Self {
        let timeout = original_timeout
            .map(|timeout| timeout.as_secs_f64().to_string())
            .unwrap_or_else(|| String::from("<unbounded>"));
        Self::Client {
            message: format!(
                "failed to obtain a connection from the pool within {timeout}s (timeout)"
            ),
        }
    }

    /// Whether the error must abort an ongoing routing table refresh
    /// instead of being retried against a sibling router.
    pub(crate) fn fatal_during_discovery(&self) -> bool {
        match self {
            PoolError::Server { error } => error.fatal_during_discovery(),
            PoolError::Client { .. } => true,
            PoolError::UserCallback { .. } => true,
            _ => false,
        }
    }
}

/// An error as reported by the server, identified by its status code.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ServerError {
    pub code: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: String, message: String) -> Self {
        Self { code, message }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn classification(&self) -> &str {
        self.code.split('.').nth(1).unwrap_or("")
    }

    pub(crate) fn fatal_during_discovery(&self) -> bool {
        match self.code() {
            "Neo.ClientError.Database.DatabaseNotFound"
            | "Neo.ClientError.Transaction.InvalidBookmark"
            | "Neo.ClientError.Transaction.InvalidBookmarkMixture"
            | "Neo.ClientError.Statement.TypeError"
            | "Neo.ClientError.Statement.ArgumentError"
            | "Neo.ClientError.Request.Invalid" => true,
            code => {
                code.starts_with("Neo.ClientError.Security.")
                    && code != "Neo.ClientError.Security.AuthorizationExpired"
            }
        }
    }

    pub(crate) fn deactivates_server(&self) -> bool {
        self.code.as_str() == "Neo.TransientError.General.DatabaseUnavailable"
    }

    pub(crate) fn invalidates_writer(&self) -> bool {
        matches!(
            self.code(),
            "Neo.ClientError.Cluster.NotALeader"
                | "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase"
        )
    }
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error: {} (code: {})", self.message, self.code)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UserCallbackError {
    /// The configured address resolver returned an error.
    #[error("resolver callback failed: {0}")]
    Resolver(BoxError),
}

impl UserCallbackError {
    pub fn user_error(&self) -> &dyn StdError {
        match self {
            UserCallbackError::Resolver(err) => err.as_ref(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
