// Mockall triggers this warning for every mocked trait. This is fixed in Mockall master but not
// released.
#![cfg_attr(test, allow(clippy::unused_unit))]

#[macro_use]
pub mod macros;

pub mod batching;
pub mod config;
pub mod dispatch;
pub mod distance;
pub mod engine;
pub mod escalation;
pub mod events;
pub mod health;
pub mod http;
pub mod http_server;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod routing;
pub mod state_machine;
pub mod store;
pub mod util;
