// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Connector and scheduler errors.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Why a `connect` call failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The connector was stopped before or during the attempt.
    #[error("connect cancelled")]
    Cancelled,

    #[error("failed to resolve {host}:{port}")]
    ResolutionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("socket setup failed during {stage}")]
    SocketSetupFailed {
        stage: SetupStage,
        #[source]
        source: io::Error,
    },

    /// The peer or the network refused the connection.
    #[error("connection to {addr} failed")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Readiness registration or socket option query failed, unrelated to the peer.
    #[error("scheduler integration failed: {op}")]
    SchedulerIntegrationFailed {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ConnectError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConnectError::Cancelled)
    }
}

/// Step of socket preparation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Create,
    Bind,
    NonBlocking,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupStage::Create => write!(f, "socket creation"),
            SetupStage::Bind => write!(f, "bind"),
            SetupStage::NonBlocking => write!(f, "non-blocking mode"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Tasks remain but no timer, readiness registration or wake can resume them.
    #[error("{suspended} task(s) suspended with nothing left to resume them")]
    Stalled { suspended: usize },

    #[error("reactor failure")]
    Reactor(#[from] io::Error),

    #[error("task finished without producing a value")]
    Incomplete,
}
