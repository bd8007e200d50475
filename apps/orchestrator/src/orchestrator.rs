//! Run admission, dispatch, callbacks and recovery for funded projects.

pub mod budget;
pub mod dispatch;
pub mod gate;
pub mod run_token;
pub mod service;
pub mod store;
pub mod templates;
pub mod types;
pub mod workers;

#[cfg(test)]
mod tests;

pub use service::{OrchestratorError, OrchestratorPolicy, OrchestratorService};
pub use store::{OrchestratorStore, StoreError};
