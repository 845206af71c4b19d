//! The request/response backbone of the control plane.
//!
//! Every operation between controller modules travels as a [`Cbt`], a
//! correlation-bearing envelope routed by the [`Nexus`]. Modules never share
//! state; they coordinate exclusively through these messages, through the
//! pub/sub [`Publisher`] for lifecycle events, and through the
//! [`TimedTransactions`] watchdog for deadlines.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cbt;
mod nexus;
pub mod names;
mod pubsub;
mod remote_action;
mod timed;

pub use cbt::{Cbt, CbtTag, Request, Response};
pub use nexus::{spawn_module, BusMsg, ControllerModule, HandlerTable, Inbox, ModuleHandle, Nexus};
pub use pubsub::{Publisher, Subscription};
pub use remote_action::RemoteAction;
pub use timed::{TimedTransactions, DEFAULT_PRIORITY};
