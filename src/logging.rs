use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `HYPHAE_LOG=hyphae=debug`.
pub const LOG_ENV: &str = "HYPHAE_LOG";

/// Install the global subscriber. Logs go to stderr so `--json` output on
/// stdout stays machine readable.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        // Fall back to the default level if the variable is unset or invalid
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV)
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
