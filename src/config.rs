//! System glue: settings and logging.
//!
//! Every option is an environment variable (GATEWAY_*) with a CLI flag of
//! the same name on top, so the daemon runs unattended from a unit file
//! and still takes one-off overrides on the command line.

use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::cycling::AnticyclingDefaults;
use crate::handler::HandlerOptions;

#[derive(Clone, Debug, Parser)]
#[command(name = "heatbus-gateway", version, about)]
pub struct Settings {
    /// Serial device the RS-485 adapter lives on.
    #[arg(long, env = "GATEWAY_SERIAL_PORT", default_value = "/dev/ttyUSB0")]
    pub serial_port: String,

    #[arg(long, env = "GATEWAY_SERIAL_BAUD", default_value_t = 115_200)]
    pub serial_baud: u32,

    /// Controller bus address (1, 2 and 237 exist in the field).
    #[arg(long, env = "GATEWAY_DESTINATION_ADDRESS", default_value_t = 1)]
    pub destination_address: u16,

    /// Seconds between poll cycles.
    #[arg(long, env = "GATEWAY_POLL_INTERVAL", default_value_t = 10.0)]
    pub poll_interval: f64,

    /// Upper bound on bus silence within one exchange, seconds. The
    /// correlator converts it into its per-transaction silence budget.
    #[arg(long, env = "GATEWAY_REQUEST_TIMEOUT", default_value_t = 2.0)]
    pub request_timeout: f64,

    /// Parameters per GET_PARAMS batch.
    #[arg(long, env = "GATEWAY_PARAMS_PER_REQUEST", default_value_t = 100)]
    pub params_per_request: usize,

    /// Wait indefinitely for the panel's bus token before transmitting.
    #[arg(
        long,
        env = "GATEWAY_TOKEN_REQUIRED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub token_required: bool,

    /// Token wait bound in seconds, used only when the token is optional.
    #[arg(long, env = "GATEWAY_TOKEN_TIMEOUT", default_value_t = 30.0)]
    pub token_timeout: f64,

    #[arg(long, env = "GATEWAY_API_HOST", default_value = "0.0.0.0")]
    pub api_host: String,

    #[arg(long, env = "GATEWAY_API_PORT", default_value_t = 8000)]
    pub api_port: u16,

    /// Default log filter; RUST_LOG takes precedence when set.
    #[arg(long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Write protective anti-cycling timers once after the first poll.
    #[arg(
        long,
        env = "GATEWAY_ANTICYCLING_ENABLED",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub anticycling_enabled: bool,

    /// Minimum compressor work time to apply when the controller has 0.
    #[arg(long, env = "GATEWAY_ANTICYCLING_MIN_WORK", default_value_t = 10)]
    pub anticycling_min_work: i64,

    /// Minimum compressor break time to apply when the controller has 0.
    #[arg(long, env = "GATEWAY_ANTICYCLING_MIN_BREAK", default_value_t = 10)]
    pub anticycling_min_break: i64,
}

impl Settings {
    pub fn handler_options(&self) -> HandlerOptions {
        HandlerOptions {
            destination: self.destination_address,
            poll_interval: Duration::from_secs_f64(self.poll_interval),
            request_timeout: Duration::from_secs_f64(self.request_timeout.max(0.2)),
            params_per_request: self.params_per_request.max(1),
            token_required: self.token_required,
            token_timeout: Duration::from_secs_f64(self.token_timeout.max(0.0)),
            anticycling: self.anticycling_enabled.then(|| AnticyclingDefaults {
                min_work_time: self.anticycling_min_work,
                min_break_time: self.anticycling_min_break,
            }),
        }
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level so field debugging never needs a restart flag.
pub fn init_logging(level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_arguments() {
        let settings = Settings::try_parse_from(["heatbus-gateway"]).unwrap();
        assert_eq!(settings.serial_baud, 115_200);
        assert_eq!(settings.destination_address, 1);
        assert!(settings.token_required);
        assert_eq!(settings.api_port, 8000);

        let opts = settings.handler_options();
        assert_eq!(opts.poll_interval, Duration::from_secs(10));
        assert_eq!(opts.request_timeout, Duration::from_secs(2));
        assert_eq!(opts.params_per_request, 100);
        assert!(opts.anticycling.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let settings = Settings::try_parse_from([
            "heatbus-gateway",
            "--serial-port",
            "/dev/ttyUSB3",
            "--token-required",
            "false",
            "--anticycling-enabled",
            "true",
        ])
        .unwrap();
        assert_eq!(settings.serial_port, "/dev/ttyUSB3");
        assert!(!settings.token_required);
        assert!(settings.handler_options().anticycling.is_some());
    }
}
