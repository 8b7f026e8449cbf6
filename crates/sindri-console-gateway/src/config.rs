use clap::Parser;
use sindri_console_core::protocol::DEFAULT_MAX_MESSAGE_BYTES;
use sindri_console_core::topics::{COMMAND_RESULT_TTL, ONLINE_TTL};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_ADDR: &str = "127.0.0.1:3001";
const DEFAULT_DB_PATH: &str = ".sindri/console.db";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub db_path: PathBuf,
    pub log_dir: String,
    pub debug: bool,
    pub node_id: String,
    /// Shared pub/sub and kv server; in-process backends when unset.
    pub redis_url: Option<String>,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
    pub online_ttl: Duration,
    pub command_result_ttl: Duration,
    pub metrics_flush_interval: Duration,
    pub metrics_batch_size: usize,
    pub metrics_queue_capacity: usize,
    pub outbound_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            log_dir: String::new(),
            debug: false,
            node_id: new_node_id(),
            redis_url: None,
            ping_interval: Duration::from_secs(20),
            write_timeout: Duration::from_secs(5),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            online_ttl: ONLINE_TTL,
            command_result_ttl: COMMAND_RESULT_TTL,
            metrics_flush_interval: Duration::from_millis(5000),
            metrics_batch_size: 500,
            metrics_queue_capacity: 10_000,
            outbound_queue: 256,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sindri-gateway")]
pub struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db_path: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    redis_url: String,
    #[arg(long, default_value_t = 20)]
    ping_interval: u64,
    #[arg(long, default_value_t = 5)]
    write_timeout: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,
    #[arg(long, default_value_t = 30)]
    online_ttl: u64,
    #[arg(long, default_value_t = 120)]
    command_result_ttl: u64,
    #[arg(long, default_value_t = 5000)]
    metrics_flush_ms: u64,
    #[arg(long, default_value_t = 500)]
    metrics_batch_size: usize,
    #[arg(long, default_value_t = 10_000)]
    metrics_queue_capacity: usize,
    #[arg(long, default_value_t = 256)]
    outbound_queue: usize,
}

pub fn load_config() -> Config {
    Config::from_args(Args::parse())
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        Self {
            addr: resolve_value(&args.addr, "SINDRI_GATEWAY_ADDR", DEFAULT_ADDR),
            db_path: PathBuf::from(resolve_value(
                &args.db_path,
                "SINDRI_GATEWAY_DB",
                DEFAULT_DB_PATH,
            )),
            log_dir: resolve_value(&args.log_dir, "SINDRI_LOG_DIR", ""),
            debug: args.debug || env_true("SINDRI_GATEWAY_DEBUG"),
            node_id: new_node_id(),
            redis_url: Some(resolve_value(&args.redis_url, "SINDRI_REDIS_URL", ""))
                .filter(|url| !url.trim().is_empty()),
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout.max(1)),
            max_message_bytes: args.max_message_bytes.max(1),
            online_ttl: Duration::from_secs(args.online_ttl.max(1)),
            command_result_ttl: Duration::from_secs(args.command_result_ttl.max(1)),
            metrics_flush_interval: Duration::from_millis(args.metrics_flush_ms.max(1)),
            metrics_batch_size: args.metrics_batch_size.max(1),
            metrics_queue_capacity: args.metrics_queue_capacity.max(1),
            outbound_queue: args.outbound_queue.max(1),
        }
    }
}

fn new_node_id() -> String {
    format!("gw-{}", Uuid::new_v4().simple())
}

fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
