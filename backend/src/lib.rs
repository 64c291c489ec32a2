pub mod alerts;
pub mod buffer;
pub mod config;
pub mod detector;
pub mod email;
pub mod error;
pub mod features;
pub mod ml;
pub mod model;
pub mod monitor;
pub mod routes;
pub mod store;
pub mod vitals;
pub mod websockets;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

use std::sync::Arc;

/// **Global Application State**
///
/// Shared by every worker: the monitor owns the device windows, the alert
/// engine, and the broadcast channel dashboards subscribe to.
pub struct AppState {
    pub monitor: Arc<monitor::Monitor>,
}
