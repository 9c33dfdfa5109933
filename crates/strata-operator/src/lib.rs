//! Strata operator - controllers for managed database instances and their dependents
//!
//! Every managed kind runs the same convergence step (see [`converge`]):
//! one unit of work per pass, an outcome mapped to a single condition
//! reason, and a status write only when that reason changes. Recurring
//! backups and maintenance windows are driven by the [`crontab`].

pub mod agent_client;
pub mod context;
pub mod controller;
pub mod controller_runner;
pub mod converge;
pub mod crontab;
pub mod notify;
pub mod resolver;
pub mod settings;
pub mod store;
pub mod workload;

pub use context::{Context, ContextBuilder};
