use clap::{Args, Parser, Subcommand};
use keylock_core::{
    LockOptions, ProviderConfig, TimeUnit, DEFAULT_LEASE_TIME, DEFAULT_WAIT_TIME,
};
use serde_json::Value;

/// Configuration for the keylock command-line client.
#[derive(Parser, Debug, Clone)]
#[command(name = "keylock")]
#[command(about = "Take and release distributed locks on Redis")]
pub struct Config {
    /// Redis server to lock on
    #[arg(long, default_value = "redis://127.0.0.1:6379", env = "REDIS_URL")]
    pub redis_url: String,

    /// Pause between acquisition attempts (milliseconds)
    #[arg(long, default_value = "100", env = "KEYLOCK_RETRY_INTERVAL_MS")]
    pub retry_interval_ms: u64,

    /// Expiry of locks without a fixed lease, renewed while held (milliseconds)
    #[arg(long, default_value = "30000", env = "KEYLOCK_WATCHDOG_TIMEOUT_MS")]
    pub watchdog_timeout_ms: u64,

    /// How long a fair waiter keeps its place without polling (milliseconds)
    #[arg(long, default_value = "5000", env = "KEYLOCK_FAIR_WAITER_TIMEOUT_MS")]
    pub fair_waiter_timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            retry_interval_ms: self.retry_interval_ms,
            watchdog_timeout_ms: self.watchdog_timeout_ms,
            fair_waiter_timeout_ms: self.fair_waiter_timeout_ms,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Take a single key and print the owner token
    Acquire {
        #[arg(long)]
        key: String,

        /// Token to store; a fresh one is generated when omitted
        #[arg(long)]
        token: Option<String>,

        /// Expiry of the key (milliseconds)
        #[arg(long, default_value = "3000")]
        ttl_ms: u64,

        /// Keep retrying for this long before giving up (milliseconds)
        #[arg(long)]
        retry_budget_ms: Option<u64>,
    },

    /// Release a key taken with `acquire`
    Release {
        #[arg(long)]
        key: String,

        #[arg(long)]
        token: String,
    },

    /// Run a command while holding the locks named by key templates
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Key template such as `order:#id`; repeat to lock several keys together
    #[arg(long = "key", required = true)]
    pub keys: Vec<String>,

    /// Named argument for the templates, as `name=json`
    #[arg(long = "arg", value_parser = parse_named_arg)]
    pub args: Vec<(String, Value)>,

    /// Grant the lock to waiters in arrival order
    #[arg(long)]
    pub fair: bool,

    /// Lease time, -1 to hold until the command exits
    #[arg(long, default_value_t = DEFAULT_LEASE_TIME, allow_hyphen_values = true)]
    pub lease_time: i64,

    /// Wait time, -1 to wait until acquired
    #[arg(long, default_value_t = DEFAULT_WAIT_TIME, allow_hyphen_values = true)]
    pub wait_time: i64,

    /// Unit of lease and wait time (ns, us, ms, s, min, h, d)
    #[arg(long, default_value = "ms")]
    pub time_unit: TimeUnit,

    /// Command to run and its arguments
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions::keys(self.keys.iter().cloned())
            .fair(self.fair)
            .lease_time(self.lease_time)
            .wait_time(self.wait_time)
            .time_unit(self.time_unit)
    }
}

/// Parse `name=json`; a value that is not valid JSON is taken as a string.
pub fn parse_named_arg(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing argument name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}
