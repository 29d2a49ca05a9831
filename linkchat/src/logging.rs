pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger. Components receive child loggers
/// derived from this root.
pub fn root() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// A logger that drops everything. Used when a component is constructed
/// without a parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a component logger.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}
