//! Dependency-aware work queue with bounded, loop-detecting retries.
//!
//! Items enter through [`intake`], wait in the [`store`] until the
//! [`resolver`] finds their dependencies satisfied, and are handed out by the
//! [`scheduler`]. The [`engine`] routes each claimed item to an
//! [`executor`](executor::Executor) and feeds failures through [`recovery`],
//! which retries on a fresh failure signature and halts for a human when the
//! same signature keeps coming back.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ids;
pub mod intake;
pub mod marker;
pub mod model;
pub mod output;
pub mod paths;
pub mod recovery;
pub mod resolver;
pub mod router;
pub mod scheduler;
pub mod signature;
pub mod store;
pub mod validate;
pub mod watch;
