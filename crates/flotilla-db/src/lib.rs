//! flotilla-db — the reactive in-memory database at the center of the
//! system.
//!
//! The policy engine writes a preferred state of the world into typed
//! tables; reconcilers flesh that policy out with implementation detail
//! (cloud IDs, IP addresses, runtime IDs) and react to each other's writes
//! through change subscriptions.
//!
//! # Shape
//!
//! - [`Conn`] is a cheap handle every loop holds. [`Conn::txn`] runs a
//!   closure against the declared [`TableSet`], locking tables in one
//!   canonical order.
//! - [`Conn::trigger`] / [`Conn::trigger_tick`] return a [`Trigger`] whose
//!   capacity-1 mailbox collapses bursts of changes; control loops
//!   `select!` over it and a shutdown channel.
//! - [`Conn::register_callback`] spawns a serial consumer task for a
//!   [`Callback`], the registration-style alternative used where a body
//!   should also react to an external channel (see
//!   [`CallbackHandle::bind_trigger`]).
//!
//! State is process-lifetime only; nothing here persists.

mod callback;
mod db;
mod error;
mod tables;

pub use callback::{Callback, CallbackHandle, Cause, Trigger};
pub use db::{Conn, Row, Table, View};
pub use error::DbError;
pub use tables::{
    AclRule, Cluster, Connection, Container, Etcd, Hostname, Image, Label, Machine, Minion,
    Placement, Provider, Role, RowId, TableKind, TableSet,
};
