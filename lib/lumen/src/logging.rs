//! Structured logging for all broker components.
//!
//! Components hold a `Logger` and derive children with `log.new(o!(...))`.
//! Tests that don't care about output use `discard()`.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the root terminal logger used by the daemon binaries.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("embedded logger config must parse");

    config.build_logger().expect("terminal logger construction failed")
}

/// A logger that swallows everything.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
