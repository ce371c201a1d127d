//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub producer: ProducerConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    /// How long a writer waits on a locked database before giving up
    pub busy_timeout_ms: u64,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub blocks_per_run: u32,
    /// Sampler cycle namespace; separate namespaces keep independent cycles over the same pool
    pub namespace: String,
    /// Newline-delimited blocks, consumed once when the pool is empty
    pub seed_file: String,
    /// Producer lines longer than this are treated as truncated and dropped
    pub max_line_len: usize,
    pub flush_batch: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    pub program: String,
    /// Argument template. Recognised placeholders: {block}, {port}, {rate}, {cooldown}
    pub args: Vec<String>,
    /// Label stored with every endpoint this producer reports
    pub source: String,
    pub port: u16,
    pub rate: u32,
    pub cooldown_secs: u32,
    pub quiet: bool,
    pub quiet_flag: String,
    #[serde(default)]
    pub interface: Option<String>,
    pub interface_flag: String,
    #[serde(default)]
    pub gateway_mac: Option<String>,
    pub gateway_flag: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    /// Delay used by run-now when the scheduler was never armed
    pub default_delay_seconds: i64,
    pub run_now_epsilon_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub operator_log: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("database.url", "reconloop.db")?
            .set_default("database.busy_timeout_ms", 5000)?
            .set_default("database.max_connections", 4)?
            .set_default("pipeline.blocks_per_run", 4)?
            .set_default("pipeline.namespace", "default")?
            .set_default("pipeline.seed_file", "blocks.txt")?
            .set_default("pipeline.max_line_len", 256)?
            .set_default("pipeline.flush_batch", 128)?
            .set_default("producer.program", "zmap")?
            .set_default(
                "producer.args",
                vec!["-p", "{port}", "-r", "{rate}", "-c", "{cooldown}", "{block}"],
            )?
            .set_default("producer.source", "zmap")?
            .set_default("producer.port", 80)?
            .set_default("producer.rate", 10000)?
            .set_default("producer.cooldown_secs", 8)?
            .set_default("producer.quiet", true)?
            .set_default("producer.quiet_flag", "-q")?
            .set_default("producer.interface_flag", "-i")?
            .set_default("producer.gateway_flag", "-G")?
            .set_default("scheduler.poll_interval_ms", 1000)?
            .set_default("scheduler.default_delay_seconds", 3600)?
            .set_default("scheduler.run_now_epsilon_ms", 250)?
            .set_default("logging.level", "info")?
            .set_default("logging.operator_log", "reconloop.log")?
            .set_default("server.enabled", false)?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8088)?
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("RECONLOOP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("producer.args")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        if self.pipeline.blocks_per_run == 0 {
            anyhow::bail!("pipeline.blocks_per_run must be at least 1");
        }
        if self.pipeline.namespace.is_empty() {
            anyhow::bail!("pipeline.namespace cannot be empty");
        }
        if self.pipeline.max_line_len == 0 {
            anyhow::bail!("pipeline.max_line_len must be positive");
        }

        if self.producer.program.is_empty() {
            anyhow::bail!("producer.program cannot be empty");
        }
        if !self.producer.args.iter().any(|a| a.contains("{block}")) {
            anyhow::bail!("producer.args must reference {{block}} somewhere");
        }

        if self.scheduler.poll_interval_ms == 0 {
            anyhow::bail!("scheduler.poll_interval_ms must be positive");
        }
        if self.scheduler.default_delay_seconds <= 0 {
            anyhow::bail!("scheduler.default_delay_seconds must be positive");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        if self.server.enabled && self.server.port == 0 {
            anyhow::bail!("Invalid server port: 0 is not allowed");
        }

        Ok(())
    }
}
