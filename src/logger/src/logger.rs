use std::io::Write;

use env_logger::Builder;

/// Filter variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "QUORRA_LOG";

const DEFAULT_FILTER: &str = "info";

/// Install the process-wide logger.
///
/// Lines look like `2026-10-18T09:14:02.311Z INFO  [cluster::coordinator] ...`.
/// Task traces are emitted at debug level under the `quorra::task` target, so
/// `QUORRA_LOG=info,quorra::task=debug` shows them without the rest.
pub fn setup_logging() {
    let filter = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string());

    let mut builder = Builder::new();
    builder.parse_filters(&filter);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} {:<5} [{}] {}",
            buf.timestamp_millis(),
            record.level(),
            record.target(),
            record.args()
        )
    });

    if builder.try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}
