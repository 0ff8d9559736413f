use tracing_subscriber::{fmt, EnvFilter};

/// Logs go to stderr; stdout carries the IPC protocol.
///
/// Level comes from `RUST_LOG` (default `info`), e.g. `RUST_LOG=gradebookd=debug`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .try_init();
}
