//! Readiness reporting for the monitoring HTTP server. The engine flips to
//! ready once every long-lived loop has completed at least one iteration.

use crate::http_server::Handler;
use anyhow::Result;
use rouille::{Request, Response};
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg_attr(test, mockall::automock)]
pub trait HealthReporting: Send + Sync {
    /// Notify that the service is ready to serve its purpose.
    fn notify_ready(&self);
}

/// Readiness state exposed over HTTP.
#[derive(Debug, Default)]
pub struct HttpHealthEndpoint {
    ready: AtomicBool,
}

impl HttpHealthEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl HealthReporting for HttpHealthEndpoint {
    fn notify_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }
}

impl Handler for HttpHealthEndpoint {
    fn handle_request(&self, _: &Request) -> Result<Response> {
        Ok(if self.is_ready() {
            Response::empty_204()
        } else {
            Response::text("service is not ready").with_status_code(503)
        })
    }
}
