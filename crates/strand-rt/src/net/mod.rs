// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Outbound TCP on the green scheduler.
//!
//! - resolve: host lookup and uniform candidate choice
//! - socket: attempt and connected socket ownership
//! - connector: suspend/resume connect with cancellation

pub mod connector;
pub mod resolve;
pub mod socket;

pub use connector::{ConnectState, Connector};
pub use resolve::{choose_address, Resolve, StaticResolver, SystemResolver};
pub use socket::{ConnectStats, ConnectedSocket};
