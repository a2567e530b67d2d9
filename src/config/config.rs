//! Configuration structures and loading

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    pub auth: AuthConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub image_check: ImageCheckConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

impl Configuration {
    /// Load configuration from a TOML file, then apply environment
    /// overrides and validate
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Recognised environment variables win over file values
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parse::<u16>("APP_PORT") {
            self.app.port = port;
        }
        if let Ok(env) = std::env::var("APP_ENV") {
            self.app.env = env;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.log.format = format;
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(hours) = env_parse::<u64>("JWT_EXPIRE_HOURS") {
            self.auth.jwt_expire_hours = hours;
        }
        if let Some(days) = env_parse::<u64>("JWT_REFRESH_DAYS") {
            self.auth.jwt_refresh_days = days;
        }
        if let Some(n) = env_parse::<usize>("MAX_CONCURRENT_TASKS") {
            self.scheduler.max_concurrent_tasks = n;
        }
        if let Some(secs) = env_parse::<u64>("TASK_TIMEOUT") {
            self.scheduler.task_timeout_seconds = secs;
        }
        if let Some(secs) = env_parse::<u64>("RETRY_DELAY") {
            self.scheduler.retry_delay_seconds = secs;
        }
        if let Some(n) = env_parse::<u32>("MAX_RETRIES") {
            self.scheduler.max_retries = n;
        }
        if let Some(secs) = env_parse::<u64>("CLEANUP_INTERVAL") {
            self.scheduler.cleanup_interval_seconds = secs;
        }
        if let Some(days) = env_parse::<u64>("HISTORY_RETENTION") {
            self.scheduler.history_retention_days = days;
        }
        if let Ok(tz) = std::env::var("TIMEZONE") {
            self.scheduler.timezone = tz;
        }
        if let Some(minutes) = env_parse::<u64>("DEFAULT_CHECK_INTERVAL") {
            self.image_check.default_check_interval_minutes = minutes;
        }
        if let Some(n) = env_parse::<usize>("MAX_CONCURRENT_CHECKS") {
            self.image_check.max_concurrent_checks = n;
        }
        if let Some(hours) = env_parse::<u64>("IMAGE_CACHE_HOURS") {
            self.image_check.image_cache_hours = hours;
        }
        if let Ok(host) = std::env::var("DOCKER_HOST") {
            self.runtime.docker_host = Some(host);
        }
        if let Ok(version) = std::env::var("DOCKER_API_VERSION") {
            self.runtime.api_version = Some(version);
        }
        if let Some(secs) = env_parse::<u64>("DOCKER_TIMEOUT") {
            self.runtime.timeout_seconds = secs;
        }
        if let Ok(path) = std::env::var("DB_PATH") {
            self.database.path = path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.len() < 32 {
            bail!("JWT_SECRET must be at least 32 characters");
        }
        if self.scheduler.max_concurrent_tasks == 0 {
            bail!("MAX_CONCURRENT_TASKS must be at least 1");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_env")]
    pub env: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            env: default_env(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_env() -> String {
    "production".into()
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

/// SQLite settings
///
/// The pool knobs are accepted for config compatibility; SQLite runs on a
/// single connection, so they are advisory.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,

    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,

    #[serde(default = "default_conn_max_lifetime")]
    pub conn_max_lifetime_minutes: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_idle_conns: default_max_idle_conns(),
            max_open_conns: default_max_open_conns(),
            conn_max_lifetime_minutes: default_conn_max_lifetime(),
        }
    }
}

fn default_db_path() -> String {
    "drydock.db".into()
}

fn default_max_idle_conns() -> u32 {
    5
}

fn default_max_open_conns() -> u32 {
    25
}

fn default_conn_max_lifetime() -> u64 {
    60
}

/// Gateway authentication settings
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret, at least 32 characters
    pub jwt_secret: String,

    #[serde(default = "default_jwt_expire_hours")]
    pub jwt_expire_hours: u64,

    #[serde(default = "default_jwt_refresh_days")]
    pub jwt_refresh_days: u64,
}

fn default_jwt_expire_hours() -> u64 {
    24
}

fn default_jwt_refresh_days() -> u64 {
    7
}

/// Scheduler settings
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Fallback task timeout when neither parameters nor the task type
    /// provide one; 0 disables
    #[serde(default)]
    pub task_timeout_seconds: u64,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    #[serde(default = "default_history_retention")]
    pub history_retention_days: u64,

    /// IANA zone name used to evaluate cron expressions
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_seconds: 0,
            retry_delay_seconds: default_retry_delay(),
            max_retries: default_max_retries(),
            cleanup_interval_seconds: default_cleanup_interval(),
            history_retention_days: default_history_retention(),
            timezone: default_timezone(),
        }
    }
}

fn default_max_concurrent_tasks() -> usize {
    10
}

fn default_retry_delay() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_history_retention() -> u64 {
    30
}

fn default_timezone() -> String {
    "UTC".into()
}

/// Image check settings
#[derive(Debug, Clone, Deserialize)]
pub struct ImageCheckConfig {
    #[serde(default = "default_check_interval")]
    pub default_check_interval_minutes: u64,

    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,

    /// How long a cache row satisfies a check before the registry is asked
    /// again
    #[serde(default = "default_image_cache_hours")]
    pub image_cache_hours: u64,
}

impl Default for ImageCheckConfig {
    fn default() -> Self {
        Self {
            default_check_interval_minutes: default_check_interval(),
            max_concurrent_checks: default_max_concurrent_checks(),
            image_cache_hours: default_image_cache_hours(),
        }
    }
}

fn default_check_interval() -> u64 {
    60
}

fn default_max_concurrent_checks() -> usize {
    5
}

fn default_image_cache_hours() -> u64 {
    6
}

/// Container runtime settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime endpoint (`unix:///var/run/docker.sock`, `tcp://...`);
    /// local defaults when unset
    #[serde(default)]
    pub docker_host: Option<String>,

    #[serde(default)]
    pub api_version: Option<String>,

    #[serde(default = "default_runtime_timeout")]
    pub timeout_seconds: u64,
}

fn default_runtime_timeout() -> u64 {
    30
}

/// Update orchestration settings
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,

    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_seconds: u64,

    #[serde(default = "default_health_retries")]
    pub health_check_retries: u32,

    /// Parallel updates allowed in batch and group rollouts
    #[serde(default = "default_orchestrator_concurrency")]
    pub max_concurrent: usize,

    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,

    #[serde(default = "default_true")]
    pub pre_update_backup: bool,

    /// `always`, `if-not-present` or `never`
    #[serde(default = "default_pull_policy")]
    pub pull_policy: String,

    /// Windows admitting automatic updates; empty means always
    #[serde(default)]
    pub maintenance_windows: Vec<MaintenanceWindowSection>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            stop_grace_seconds: default_stop_grace(),
            health_check_timeout_seconds: default_health_timeout(),
            health_check_retries: default_health_retries(),
            max_concurrent: default_orchestrator_concurrency(),
            rollback_on_failure: true,
            pre_update_backup: true,
            pull_policy: default_pull_policy(),
            maintenance_windows: Vec::new(),
        }
    }
}

/// One maintenance window as written in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceWindowSection {
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_stop_grace() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    300
}

fn default_health_retries() -> u32 {
    3
}

fn default_orchestrator_concurrency() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_pull_policy() -> String {
    "always".into()
}
