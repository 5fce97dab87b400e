//! FabricFS CSI controller: volume and snapshot provisioning against the
//! FabricFS clustered filesystem.
//!
//! The engine reconciles the synchronous, idempotent, at-least-once CSI
//! contract with a slow, partially observable cluster management API. It
//! keeps no durable state of its own: every map here is advisory and safe
//! to lose on restart.

pub mod cluster_cache;
pub mod controller;
pub mod driver;
pub mod error;
pub mod fileset;
pub mod guard;
pub mod id;
pub mod jobs;
pub mod lightweight;
pub mod settings;
pub mod snapwindow;
pub mod version;
pub mod volume;

#[cfg(test)]
mod testutil;

pub use controller::ControllerService;
pub use driver::Driver;
pub use error::{ControllerError, Result};
