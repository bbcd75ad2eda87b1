//! Logging setup. The crate logs through the `log` facade; this module wires
//! the facade to an slog terminal drain with envlogger-style filtering.

use slog::{o, Drain as _, Logger};
use slog_scope::GlobalLoggerGuard;

/// Initializes the global logger from an envlogger filter string (e.g.
/// `"warn,fleet_core=debug"`) and returns the guard that keeps it alive.
pub fn init(filter: &str) -> (Logger, GlobalLoggerGuard) {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let format = slog_term::FullFormat::new(decorator).build().fuse();
    let filtered = slog_envlogger::LogBuilder::new(format).parse(filter).build();
    let drain = slog_async::Async::new(filtered.fuse())
        .chan_size(2048)
        .build()
        .fuse();
    let logger = Logger::root(drain, o!());

    let guard = slog_scope::set_global_logger(logger.clone());
    slog_stdlog::init().expect("failed to register logger");

    (logger, guard)
}
