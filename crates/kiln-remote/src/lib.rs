//! kiln-remote — everything that talks to the remote compute API.
//!
//! The remote system only offers asynchronous, pollable primitives: an
//! instance boots in the background, an agent command is queued and later
//! reports a result, a file fetch lands in a content blob. This crate turns
//! those into straight-line `async` calls.
//!
//! # Components
//!
//! - **`api`** — collaborator traits ([`ComputeApi`], [`NetworkApi`]) and wire types
//! - **`client`** — [`RestClient`], the HTTP implementation of those traits
//! - **`tracker`** — [`OperationTracker`], polling waits with fail-fast results
//! - **`fleet`** — [`FleetManager`], create/boot/delete groups of instances
//! - **`sim`** — [`sim::SimCloud`], an in-process cloud for tests (feature `sim`)

pub mod api;
pub mod client;
pub mod error;
pub mod fleet;
pub mod tracker;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use api::*;
pub use client::RestClient;
pub use error::{RemoteError, RemoteResult};
pub use fleet::FleetManager;
pub use tracker::{OperationTracker, PollPolicy};
