// SPDX-License-Identifier: GPL-3.0-only

//! Test doubles and fixtures for exercising the reconciler without a host.

pub mod backend;
pub mod fixtures;
pub mod store;

pub use backend::{Call, MemoryBackend, Operation};
pub use store::StaticConfigStore;
