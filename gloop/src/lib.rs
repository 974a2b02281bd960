//! Fair, preemptible arbitration of a single GPU launch slot between processes.
//!
//! A [`Monitor`](monitor::Monitor) accepts clients over TCP, gives each one a
//! session with its own shared-memory channels, and hands the kernel lock to
//! the contender with the least accumulated use. A watchdog asks the holder
//! to abort through a word in its shared region whenever someone else waits.

// Bindings that exist only to be logged go unread when logging compiles out.
#![cfg_attr(not(feature = "tracing"), allow(unused_variables))]

// Allow the crate to reference itself as ::gloop for derive macro usage
extern crate self as gloop;

pub mod client;
pub mod command;
pub mod config;
pub mod ipc;
pub mod monitor;
pub mod sync;
pub mod timing;
pub mod trace;

mod mpsc;
mod spsc;

pub use client::{Client, ClientError};
pub use command::{Command, CommandKind};
pub use config::MonitorConfig;
pub use monitor::{Monitor, MonitorError};
pub use trace::init_tracing;

#[doc(inline)]
pub use gloop_derive::SharedMemorySafe;

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use ipc::shmem::SharedMemorySafe as __SharedMemorySafePrivate;
