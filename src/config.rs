//! Command-line configuration.
//!
//! `Args` is parsed once at startup and validated into an immutable
//! [`ProxyConfig`]; nothing downstream re-reads the command line.

use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::dispatcher::Timeouts;
use crate::gateway::GatewayEndpoint;
use crate::paginator::{parse_duration, BarInterval, PaginatorConfig, WindowTable};
use crate::session::{BackoffPolicy, SessionConfig};

/// IBKR Proxy Server - bridges browser apps to IB Gateway/TWS.
#[derive(Parser, Debug, Clone)]
#[command(name = "ibkr-proxy", version)]
pub struct Args {
    /// IB Gateway/TWS host
    #[arg(long = "ib-host", default_value = "127.0.0.1")]
    pub ib_host: String,

    /// IB Gateway/TWS port (7497 paper TWS, 7496 live TWS, 4002 Gateway)
    #[arg(long = "ib-port", default_value_t = 7497)]
    pub ib_port: u16,

    /// IB API client ID
    #[arg(long = "client-id", default_value_t = 1)]
    pub client_id: i32,

    /// Proxy listen host
    #[arg(long = "proxy-host", default_value = "127.0.0.1")]
    pub proxy_host: String,

    /// Proxy listen port
    #[arg(long = "proxy-port", default_value_t = 3005)]
    pub proxy_port: u16,

    /// Seconds allowed for opening the gateway connection
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Seconds a request waits for the session before failing with 503
    #[arg(long, default_value_t = 10)]
    pub ensure_timeout_secs: u64,

    /// Seconds between keep-alive checks
    #[arg(long, default_value_t = 30)]
    pub health_interval_secs: u64,

    /// Seconds a keep-alive check may take
    #[arg(long, default_value_t = 5)]
    pub health_timeout_secs: u64,

    /// First reconnect delay in milliseconds; doubles per attempt
    #[arg(long, default_value_t = 1000)]
    pub backoff_base_ms: u64,

    /// Upper bound on the reconnect delay in seconds
    #[arg(long, default_value_t = 60)]
    pub backoff_max_secs: u64,

    /// Give up reconnecting after this many attempts (default: never)
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    /// Timeout for account, position and current-time requests, seconds
    #[arg(long, default_value_t = 10)]
    pub account_timeout_secs: u64,

    /// Timeout for symbol search and contract details, seconds
    #[arg(long, default_value_t = 15)]
    pub search_timeout_secs: u64,

    /// Timeout for one historical data window, seconds
    #[arg(long, default_value_t = 60)]
    pub historical_timeout_secs: u64,

    /// Maximum windows fetched for one historical call
    #[arg(long, default_value_t = 20)]
    pub max_rounds: u32,

    /// Retries for a failed historical window
    #[arg(long, default_value_t = 2)]
    pub window_retries: u32,

    /// Largest `limit` accepted by /loadData and /loadMoreData
    #[arg(long, default_value_t = 5000)]
    pub max_bars: usize,

    /// Window span override, e.g. --window "1 min=2 D" (repeatable)
    #[arg(long = "window", value_name = "INTERVAL=DURATION")]
    pub windows: Vec<String>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid window override '{0}': expected INTERVAL=DURATION")]
    WindowOverride(String),
    #[error("invalid window override '{spec}': {reason}")]
    WindowValue { spec: String, reason: String },
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub session: SessionConfig,
    pub timeouts: Timeouts,
    pub paginator: PaginatorConfig,
    pub windows: WindowTable,
    pub proxy_host: String,
    pub proxy_port: u16,
}

impl ProxyConfig {
    pub fn endpoint(&self) -> &GatewayEndpoint {
        &self.session.endpoint
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }
}

fn non_zero(value: u64, name: &'static str) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero(name));
    }
    Ok(Duration::from_secs(value))
}

fn parse_window(spec: &str) -> Result<(BarInterval, String), ConfigError> {
    let (interval, duration) = spec
        .split_once('=')
        .ok_or_else(|| ConfigError::WindowOverride(spec.to_string()))?;
    let bad = |e: crate::error::ProxyError| ConfigError::WindowValue {
        spec: spec.to_string(),
        reason: e.to_string(),
    };
    let interval: BarInterval = interval.parse().map_err(bad)?;
    let duration = parse_duration(duration).map_err(bad)?;
    Ok((interval, duration))
}

impl TryFrom<Args> for ProxyConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.ib_host.trim().is_empty() {
            return Err(ConfigError::Empty("--ib-host"));
        }
        if args.proxy_host.trim().is_empty() {
            return Err(ConfigError::Empty("--proxy-host"));
        }
        if args.max_bars == 0 {
            return Err(ConfigError::Zero("--max-bars"));
        }
        if args.max_rounds == 0 {
            return Err(ConfigError::Zero("--max-rounds"));
        }
        if args.backoff_base_ms == 0 {
            return Err(ConfigError::Zero("--backoff-base-ms"));
        }

        let mut windows = WindowTable::new();
        for spec in &args.windows {
            let (interval, duration) = parse_window(spec)?;
            windows = windows.with_override(interval, duration);
        }

        let account_timeout = non_zero(args.account_timeout_secs, "--account-timeout-secs")?;
        let search_timeout = non_zero(args.search_timeout_secs, "--search-timeout-secs")?;

        Ok(Self {
            session: SessionConfig {
                endpoint: GatewayEndpoint {
                    host: args.ib_host.trim().to_string(),
                    port: args.ib_port,
                    client_id: args.client_id,
                },
                connect_timeout: non_zero(args.connect_timeout_secs, "--connect-timeout-secs")?,
                ensure_timeout: non_zero(args.ensure_timeout_secs, "--ensure-timeout-secs")?,
                health_interval: non_zero(args.health_interval_secs, "--health-interval-secs")?,
                health_timeout: non_zero(args.health_timeout_secs, "--health-timeout-secs")?,
                backoff: BackoffPolicy {
                    base: Duration::from_millis(args.backoff_base_ms),
                    ceiling: non_zero(args.backoff_max_secs, "--backoff-max-secs")?,
                    max_attempts: args.max_reconnect_attempts,
                },
            },
            timeouts: Timeouts {
                accounts: account_timeout,
                positions: account_timeout,
                search: search_timeout,
                contract_details: search_timeout,
                historical: non_zero(args.historical_timeout_secs, "--historical-timeout-secs")?,
                current_time: account_timeout,
            },
            paginator: PaginatorConfig {
                max_rounds: args.max_rounds,
                window_retries: args.window_retries,
                max_limit: args.max_bars,
                ..PaginatorConfig::default()
            },
            windows,
            proxy_host: args.proxy_host.trim().to_string(),
            proxy_port: args.proxy_port,
        })
    }
}
