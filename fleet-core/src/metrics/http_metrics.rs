use anyhow::Result;
use prometheus::{CounterVec, IntCounterVec, Opts, Registry};
use std::time::Duration;

/// Identifies which external API an HTTP request was made to.
#[derive(Clone, Copy, Debug)]
pub enum HttpLabel {
    RoutingProvider,
}

impl HttpLabel {
    const ALL: &'static [HttpLabel] = &[HttpLabel::RoutingProvider];

    fn as_str(self) -> &'static str {
        match self {
            HttpLabel::RoutingProvider => "routing_provider",
        }
    }
}

/// Metrics over outgoing HTTP requests to external providers.
#[derive(Debug)]
pub struct HttpMetrics {
    requests: IntCounterVec,
    latency_s: CounterVec,
    response_bytes: IntCounterVec,
}

impl HttpMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new("fleet_http_requests", "number of outgoing HTTP requests"),
            &["api"],
        )?;
        let latency_s = CounterVec::new(
            Opts::new(
                "fleet_http_latency_seconds",
                "cumulative latency of outgoing HTTP requests",
            ),
            &["api"],
        )?;
        let response_bytes = IntCounterVec::new(
            Opts::new(
                "fleet_http_response_bytes",
                "cumulative size of HTTP responses",
            ),
            &["api"],
        )?;
        // Materialize every label so the series exist from startup.
        for label in HttpLabel::ALL {
            let _ = requests.with_label_values(&[label.as_str()]);
            let _ = latency_s.with_label_values(&[label.as_str()]);
            let _ = response_bytes.with_label_values(&[label.as_str()]);
        }
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency_s.clone()))?;
        registry.register(Box::new(response_bytes.clone()))?;
        Ok(Self {
            requests,
            latency_s,
            response_bytes,
        })
    }

    pub fn request(&self, label: HttpLabel, latency: Duration, size: usize) {
        let values = &[label.as_str()];
        self.requests.with_label_values(values).inc();
        self.latency_s
            .with_label_values(values)
            .inc_by(latency.as_secs_f64());
        self.response_bytes
            .with_label_values(values)
            .inc_by(size as u64);
    }
}

impl Default for HttpMetrics {
    fn default() -> Self {
        Self::new(&Registry::new()).unwrap()
    }
}
