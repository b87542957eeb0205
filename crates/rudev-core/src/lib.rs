//! # rudev-core
//!
//! Core library for rudev - the event dispatch engine of the `rudevd`
//! device-management daemon.
//!
//! This crate contains the state machine that sits between the kernel uevent
//! stream and the pool of worker subprocesses: the event queue, the conflict
//! detector that serializes events touching interacting devices, the worker
//! pool bookkeeping, and the dispatcher that binds ready events to workers.
//! Everything that talks to the outside world (netlink, the control socket,
//! inotify, process spawning) lives in the `rudev-daemon` crate and reaches
//! this crate through the [`engine::WorkerControl`] seam, which keeps the
//! dispatch semantics testable without forking a single process.
//!
//! ## Example
//!
//! ```rust
//! use rudev_core::config::Config;
//! use rudev_core::device::DeviceRecord;
//! use rudev_core::engine::Engine;
//! use std::sync::Arc;
//!
//! let config = Arc::new(Config::default());
//! let mut engine = Engine::new(config, None);
//! let dev = DeviceRecord::builder()
//!     .seqnum(1)
//!     .action("add")
//!     .devpath("/devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda")
//!     .subsystem("block")
//!     .build();
//! engine.enqueue(dev);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conflict;
pub mod control;
pub mod device;
pub mod engine;
pub mod queue;
pub mod worker;

pub use config::{Config, ResolveNameTiming};
pub use control::{ControlOp, Properties};
pub use device::{DevNum, DeviceRecord};
pub use engine::{Engine, Sig, WorkerControl};
pub use queue::{Event, EventFilter, EventState};
pub use worker::{ExitKind, Pid, Worker, WorkerPool, WorkerState};
