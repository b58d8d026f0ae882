// SPDX-License-Identifier: GPL-3.0-only

//! Event-driven reconciliation of shares onto a storage backend.
//!
//! Configuration changes arrive as [`ConfigEvent`](zshare_types::ConfigEvent)s on the
//! [`EventBus`], are folded into the desired [`PoolModel`], and the
//! [`ReconciliationEngine`] issues idempotent backend calls until the backend
//! matches. The [`Supervisor`] ties these together and performs a full
//! reconciliation against the declared configuration at startup.

pub mod bus;
pub mod dry_run;
pub mod engine;
pub mod error;
pub mod model;
pub mod spool;
pub mod status;
pub mod supervisor;

pub use bus::{BusConfig, EventBus, EventHandler, SubscriptionId};
pub use dry_run::DryRunBackend;
pub use engine::{Action, Applied, ConvergeSummary, Desired, ReconciliationEngine, RetryPolicy};
pub use error::{BusError, ModelError, ReconcileError, Result};
pub use model::{BindingChange, PoolModel, SharedModel};
pub use spool::Spool;
pub use status::StatusBoard;
pub use supervisor::{ShutdownReport, StartupReport, Supervisor, SupervisorConfig};
