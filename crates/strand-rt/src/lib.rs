// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime: a single-threaded green-task scheduler with an epoll
//! reactor, and a non-blocking TCP connector built on it.
//!
//! Components:
//! - green: cooperative scheduler, reactor, pending-operation records, timers
//! - net: resolver, socket ownership, connector
//! - config/error: tunables and error types

pub(crate) mod arena;
pub mod config;
pub mod error;
pub mod green;
pub mod net;

pub use config::{AddressFamily, ConnectorConfig, SchedulerConfig};
pub use error::{ConnectError, SchedulerError, SetupStage};
pub use green::scheduler::Scheduler;
pub use net::{ConnectState, ConnectStats, ConnectedSocket, Connector};
