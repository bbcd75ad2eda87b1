mod fleet_metrics;
mod http_metrics;
mod metrics_handler;

pub use self::{
    fleet_metrics::FleetMetrics,
    http_metrics::{HttpLabel, HttpMetrics},
    metrics_handler::MetricsHandler,
};
