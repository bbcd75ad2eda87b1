use fleet_core::{
    config::{
        BatchingConfig, DispatchConfig, DriverCaps, EscalationConfig, FleetConfig, RouteConfig,
        ScoreWeights, TierSlas, TierSpeeds,
    },
    distance,
    engine::FleetEngine,
    events::{InboundEvent, OutboundEvent},
    health::{HealthReporting, HttpHealthEndpoint},
    http::HttpFactory,
    http_server::{DefaultRouter, RouilleServer, Serving},
    logging,
    metrics::{FleetMetrics, HttpMetrics, MetricsHandler},
    store::InMemoryStore,
};
use futures::StreamExt as _;
use prometheus::Registry;
use std::{num::ParseIntError, sync::Arc, time::Duration};
use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::runtime;

#[derive(Debug, StructOpt)]
#[structopt(name = "dispatcher", rename_all = "kebab")]
struct Options {
    /// The log filter to use.
    ///
    /// This follows the `slog-envlogger` syntax (e.g. 'info,dispatcher=debug').
    #[structopt(
        long,
        env = "LOG_FILTER",
        default_value = "warn,dispatcher=info,fleet_core=info"
    )]
    log_filter: String,

    /// Port of the monitoring HTTP server (/metrics, /health/readiness).
    #[structopt(long, env = "MONITOR_PORT", default_value = "9586")]
    monitor_port: u16,

    /// Base URL of an OSRM compatible routing provider. Distance estimation
    /// falls back to haversine when unset or failing.
    #[structopt(long, env = "ROUTING_PROVIDER_URL")]
    routing_provider_url: Option<String>,

    /// The timeout in seconds of routing provider calls.
    #[structopt(
        long,
        env = "PROVIDER_TIMEOUT",
        default_value = "10",
        parse(try_from_str = duration_secs),
    )]
    provider_timeout: Duration,

    #[structopt(
        long,
        env = "DISPATCH_TICK",
        default_value = "10",
        parse(try_from_str = duration_secs),
    )]
    dispatch_tick: Duration,

    /// Initial candidate radius around an order pickup in kilometers.
    #[structopt(long, env = "DISPATCH_RADIUS_KM", default_value = "10.0")]
    dispatch_radius_km: f64,

    /// Minimum weighted score for a normal assignment.
    #[structopt(long, env = "DISPATCH_MIN_SCORE", default_value = "0.40")]
    dispatch_min_score: f64,

    /// Proximity,performance,capacity,zone weights; must sum to 1.
    #[structopt(long, env = "DISPATCH_WEIGHTS", default_value = "0.40,0.30,0.20,0.10")]
    dispatch_weights: ScoreWeights,

    #[structopt(
        long,
        env = "OFFER_TIMEOUT",
        default_value = "30",
        parse(try_from_str = duration_secs),
    )]
    offer_timeout: Duration,

    #[structopt(long, env = "MAX_OFFERS_PER_ORDER", default_value = "5")]
    max_offers_per_order: u32,

    /// Remaining SLA minutes below which dispatch bypasses the score floor.
    #[structopt(
        long,
        env = "FORCE_THRESHOLD",
        default_value = "15",
        parse(try_from_str = duration_mins),
    )]
    force_threshold: Duration,

    #[structopt(
        long,
        env = "OFFER_COOLDOWN",
        default_value = "60",
        parse(try_from_str = duration_secs),
    )]
    offer_cooldown: Duration,

    /// When set, offers wait for explicit `dispatch.offer_response` events
    /// instead of committing immediately.
    #[structopt(long, env = "MANUAL_OFFER_ACCEPTANCE")]
    manual_offer_acceptance: bool,

    #[structopt(
        long,
        env = "BATCHING_TICK",
        default_value = "60",
        parse(try_from_str = duration_secs),
    )]
    batching_tick: Duration,

    #[structopt(long, env = "PICKUP_CLUSTER_KM", default_value = "2.0")]
    pickup_cluster_km: f64,

    #[structopt(long, env = "DROP_SPAN_KM", default_value = "8.0")]
    drop_span_km: f64,

    #[structopt(long, env = "MAX_BATCH_SIZE", default_value = "6")]
    max_batch_size: usize,

    #[structopt(
        long,
        env = "ROUTE_PERIODIC_TICK",
        default_value = "5",
        parse(try_from_str = duration_mins),
    )]
    route_periodic_tick: Duration,

    /// Minimum relative improvement before a new route replaces the active
    /// one.
    #[structopt(long, env = "ROUTE_MIN_IMPROVEMENT", default_value = "0.05")]
    route_min_improvement: f64,

    /// Stop count above which the solver switches to cheapest-insertion.
    #[structopt(long, env = "ROUTE_NN_CAP", default_value = "10")]
    route_nn_cap: usize,

    /// Haversine to road distance correction factor.
    #[structopt(long, env = "ROUTE_ROAD_FACTOR", default_value = "1.3")]
    route_road_factor: f64,

    /// Concurrent event-triggered route optimizations.
    #[structopt(long, env = "ROUTE_WORKERS", default_value = "4")]
    route_workers: usize,

    #[structopt(
        long,
        env = "ESCALATION_TICK",
        default_value = "60",
        parse(try_from_str = duration_secs),
    )]
    escalation_tick: Duration,

    #[structopt(
        long,
        env = "ESCALATION_DEBOUNCE",
        default_value = "5",
        parse(try_from_str = duration_mins),
    )]
    escalation_debounce: Duration,

    #[structopt(
        long,
        env = "STUCK_THRESHOLD",
        default_value = "15",
        parse(try_from_str = duration_mins),
    )]
    stuck_threshold: Duration,

    #[structopt(long, env = "MAX_REASSIGNMENTS", default_value = "3")]
    max_reassignments: u32,

    #[structopt(long, env = "MAX_CONSECUTIVE_DELIVERIES", default_value = "5")]
    max_consecutive_deliveries: u32,

    #[structopt(long, env = "MAX_WORKING_HOURS", default_value = "8.0")]
    max_working_hours: f64,

    #[structopt(long, env = "TARGET_DELIVERIES", default_value = "25")]
    target_deliveries: u32,

    #[structopt(long, env = "MAX_CONCURRENT_ORDERS", default_value = "3")]
    max_concurrent_orders: usize,
}

impl Options {
    fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            dispatch: DispatchConfig {
                tick: self.dispatch_tick,
                radius_km: self.dispatch_radius_km,
                min_score: self.dispatch_min_score,
                weights: self.dispatch_weights,
                offer_timeout: self.offer_timeout,
                max_offers_per_order: self.max_offers_per_order,
                force_threshold: self.force_threshold,
                offer_cooldown: self.offer_cooldown,
                auto_accept_offers: !self.manual_offer_acceptance,
                ..DispatchConfig::default()
            },
            batching: BatchingConfig {
                tick: self.batching_tick,
                pickup_cluster_km: self.pickup_cluster_km,
                drop_span_km: self.drop_span_km,
                max_batch_size: self.max_batch_size,
            },
            route: RouteConfig {
                periodic_tick: self.route_periodic_tick,
                min_improvement: self.route_min_improvement,
                nn_cap: self.route_nn_cap,
                road_factor: self.route_road_factor,
                worker_pool_size: self.route_workers,
                ..RouteConfig::default()
            },
            escalation: EscalationConfig {
                tick: self.escalation_tick,
                debounce: self.escalation_debounce,
                stuck_threshold: self.stuck_threshold,
                max_reassignments: self.max_reassignments,
                ..EscalationConfig::default()
            },
            caps: DriverCaps {
                max_consecutive_deliveries: self.max_consecutive_deliveries,
                max_working_hours: self.max_working_hours,
                target_deliveries: self.target_deliveries,
                max_concurrent_orders: self.max_concurrent_orders,
                ..DriverCaps::default()
            },
            speeds: TierSpeeds::default(),
            slas: TierSlas::default(),
            ..FleetConfig::default()
        }
    }
}

fn main() {
    let options = Options::from_args();
    let (_, _guard) = logging::init(&options.log_filter);
    log::info!("starting dispatcher with runtime options: {:#?}", options);

    let (fleet_metrics, http_metrics, health) = setup_monitoring(options.monitor_port);
    let config = options.fleet_config();

    let http_factory = HttpFactory::new(options.provider_timeout, http_metrics);
    let distance = distance::create_estimator(
        &http_factory,
        options.routing_provider_url.as_deref(),
        config.route.road_factor,
        config.speeds,
    )
    .expect("failed to create the distance estimator stack");

    let store = Arc::new(InMemoryStore::new());
    let engine = FleetEngine::new(config, store, distance, Arc::new(fleet_metrics))
        .expect("invalid configuration");

    let mut runtime = runtime::Builder::new()
        .threaded_scheduler()
        .enable_all()
        .build()
        .unwrap();

    let dispatch_task = runtime.spawn(engine.clone().run_dispatch_loop());
    runtime.spawn(engine.clone().run_batching_loop());
    runtime.spawn(engine.clone().run_escalation_loop());
    runtime.spawn(engine.clone().run_route_periodic_loop());
    runtime.spawn(engine.clone().run_optimizer_workers());
    runtime.spawn(emit_outbound(engine.clone()));
    let feed_task = runtime.spawn(consume_event_feed(engine));

    log::info!("dispatcher ready.");
    runtime.block_on(async move {
        health.notify_ready();
        tokio::select! {
            _ = dispatch_task => log::error!("dispatch loop exited."),
            _ = feed_task => log::error!("event feed closed."),
        }
    });
}

/// Reads newline-delimited JSON inbound events from stdin and applies them.
/// Malformed lines are logged and skipped; the feed closing ends the
/// process.
async fn consume_event_feed(engine: Arc<FleetEngine>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                log::info!("event feed reached end of input");
                return;
            }
            Err(err) => {
                log::error!("failed to read event feed: {:?}", err);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let event: InboundEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                log::warn!("rejecting malformed event '{}': {}", line, err);
                continue;
            }
        };
        if let Err(err) = engine.apply(event).await {
            log::warn!("event rejected: {:?}", err);
        }
    }
}

/// Mirrors outbound events as newline-delimited JSON on stdout.
async fn emit_outbound(engine: Arc<FleetEngine>) {
    let mut events = engine.bus().subscribe();
    while let Some(event) = events.next().await {
        match serde_json::to_string::<OutboundEvent>(&event) {
            Ok(line) => println!("{}", line),
            Err(err) => log::warn!("failed to encode outbound event: {:?}", err),
        }
    }
}

fn duration_secs(s: &str) -> Result<Duration, ParseIntError> {
    Ok(Duration::from_secs(s.parse()?))
}

fn duration_mins(s: &str) -> Result<Duration, ParseIntError> {
    Ok(Duration::from_secs(s.parse::<u64>()? * 60))
}

fn setup_monitoring(port: u16) -> (FleetMetrics, HttpMetrics, Arc<HttpHealthEndpoint>) {
    let health = Arc::new(HttpHealthEndpoint::new());
    let prometheus_registry = Arc::new(Registry::new());

    let metric_handler = MetricsHandler::new(prometheus_registry.clone());
    RouilleServer::new(DefaultRouter {
        metrics: Arc::new(metric_handler),
        health_readiness: health.clone(),
    })
    .start_in_background(port);

    let http_metrics = HttpMetrics::new(&prometheus_registry).unwrap();
    let fleet_metrics = FleetMetrics::new(&prometheus_registry).unwrap();

    (fleet_metrics, http_metrics, health)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_produce_a_valid_config() {
        let options = Options::from_iter(&["dispatcher"]);
        assert!(options.fleet_config().validate().is_ok());
    }

    #[test]
    fn duration_parsers_reject_garbage() {
        assert_eq!(duration_secs("30").unwrap(), Duration::from_secs(30));
        assert_eq!(duration_mins("5").unwrap(), Duration::from_secs(300));
        assert!(duration_secs("soon").is_err());
    }

    #[test]
    fn overrides_flow_into_the_config() {
        let options = Options::from_iter(&[
            "dispatcher",
            "--dispatch-min-score",
            "0.5",
            "--max-batch-size",
            "4",
            "--route-workers",
            "2",
        ]);
        let config = options.fleet_config();
        assert!((config.dispatch.min_score - 0.5).abs() < 1e-9);
        assert_eq!(config.batching.max_batch_size, 4);
        assert_eq!(config.route.worker_pool_size, 2);
    }
}
