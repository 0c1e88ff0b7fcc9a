use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::heartbeat::HeartbeatSettings;

const DEFAULT_DB_FILE: &str = "~/.local/share/session-guard/tokens.sqlite3";

/// Session Guard - resilient client for the study platform API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend base URL
    #[arg(short = 'u', long, env = "API_BASE_URL")]
    pub base_url: Option<String>,

    /// Path to the SQLite token store
    #[arg(short = 'd', long, env = "TOKEN_DB_FILE")]
    pub db_file: Option<String>,

    /// Path prefix of the authentication endpoints
    #[arg(long, env = "AUTH_PATH_PREFIX", default_value = "/auth")]
    pub auth_prefix: String,

    /// Path prefix of the study-session endpoints
    #[arg(long, env = "SESSIONS_PATH_PREFIX", default_value = "/sessions")]
    pub sessions_prefix: String,

    /// Path prefix of the progress endpoints
    #[arg(long, env = "PROGRESS_PATH_PREFIX", default_value = "/progress")]
    pub progress_prefix: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Seconds before expiry at which credentials are refreshed proactively
    #[arg(long, env = "TOKEN_REFRESH_THRESHOLD", default_value = "300")]
    pub refresh_threshold: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Idle connections kept per host
    #[arg(long, env = "HTTP_MAX_CONNECTIONS", default_value = "20")]
    pub http_max_connections: usize,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub http_connect_timeout: u64,

    /// Heartbeat interval in seconds
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "60")]
    pub heartbeat_interval: u64,

    /// Server-side session timeout in seconds
    #[arg(long, env = "SESSION_TIMEOUT", default_value = "1800")]
    pub session_timeout: u64,

    /// Seconds before session timeout at which a warning is raised
    #[arg(long, env = "SESSION_WARNING_WINDOW", default_value = "300")]
    pub warning_window: u64,

    /// Seconds a deduplicated operation may stay in flight
    #[arg(long, env = "DEDUP_TTL", default_value = "30")]
    pub dedup_ttl: u64,

    /// Retries for deduplicated initialisation calls
    #[arg(long, env = "DEDUP_RETRY_COUNT", default_value = "2")]
    pub dedup_retry_count: u32,

    /// Base delay between those retries in milliseconds
    #[arg(long, env = "DEDUP_RETRY_DELAY_MS", default_value = "1000")]
    pub dedup_retry_delay_ms: u64,

    /// Service account used for the admin credential scope
    #[arg(long, env = "ADMIN_USERNAME")]
    pub admin_username: Option<String>,

    #[arg(long, env = "ADMIN_PASSWORD", hide_env_values = true)]
    pub admin_password: Option<String>,

    /// Ask before extending an expired session instead of refreshing silently
    #[arg(long, env = "INTERACTIVE_EXTENSION", default_value_t = true, action = clap::ArgAction::Set)]
    pub interactive_extension: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and persist the user credentials
    Login {
        #[arg(short = 'U', long)]
        username: String,

        /// Prompted for when omitted
        #[arg(short = 'P', long)]
        password: Option<String>,
    },

    /// Show the authenticated profile
    Profile,

    /// Ask the backend whether the stored credentials are still valid
    Validate,

    /// Keep a study session alive until Ctrl-C
    Study {
        #[arg(long)]
        course: String,

        #[arg(long)]
        module: String,

        #[arg(long)]
        lesson: String,
    },

    /// Forget the stored user credentials
    Logout,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub endpoints: EndpointConfig,

    // Storage
    pub token_db_file: PathBuf,

    // Timeouts
    pub token_refresh_threshold: u64,
    pub heartbeat_interval: u64,
    pub session_timeout: u64,
    pub session_warning_window: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Deduplicated initialisation
    pub dedup_ttl: u64,
    pub dedup_retry_count: u32,
    pub dedup_retry_delay_ms: u64,

    // Admin service identity
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,

    pub interactive_extension: bool,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Backend location and endpoint paths
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointConfig {
    pub base_url: String,
    pub auth_prefix: String,
    pub sessions_prefix: String,
    pub progress_prefix: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new("http://localhost:8080")
    }
}

impl EndpointConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_prefix: "/auth".to_string(),
            sessions_prefix: "/sessions".to_string(),
            progress_prefix: "/progress".to_string(),
        }
    }

    /// Absolute URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn login(&self) -> String {
        format!("{}/login", self.auth_prefix)
    }

    pub fn refresh(&self) -> String {
        format!("{}/refresh", self.auth_prefix)
    }

    pub fn validate(&self) -> String {
        format!("{}/validate", self.auth_prefix)
    }

    pub fn profile(&self) -> String {
        format!("{}/profile", self.auth_prefix)
    }

    pub fn session_start(&self) -> String {
        format!("{}/start", self.sessions_prefix)
    }

    pub fn session_heartbeat(&self) -> String {
        format!("{}/heartbeat", self.sessions_prefix)
    }

    pub fn session_active(&self) -> String {
        format!("{}/active", self.sessions_prefix)
    }

    pub fn session_end(&self, session_id: &str) -> String {
        format!("{}/{}/end", self.sessions_prefix, session_id)
    }

    pub fn progress_initialize(&self) -> String {
        format!("{}/initialize", self.progress_prefix)
    }

    pub fn progress_completed(&self) -> String {
        format!("{}/completed", self.progress_prefix)
    }

    pub fn progress_complete(&self) -> String {
        format!("{}/complete", self.progress_prefix)
    }

    /// Login and refresh calls never trigger a proactive refresh themselves
    pub fn is_auth_endpoint(&self, url_path: &str) -> bool {
        url_path.ends_with(&self.login()) || url_path.ends_with(&self.refresh())
    }
}

impl Config {
    /// Defaults for everything except the backend location
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            endpoints: EndpointConfig::new(base_url),
            token_db_file: expand_tilde(DEFAULT_DB_FILE),
            token_refresh_threshold: 300,
            heartbeat_interval: 60,
            session_timeout: 1800,
            session_warning_window: 300,
            http_max_connections: 20,
            http_connect_timeout: 10,
            http_request_timeout: 30,
            dedup_ttl: 30,
            dedup_retry_count: 2,
            dedup_retry_delay_ms: 1000,
            admin_username: None,
            admin_password: None,
            interactive_extension: true,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }

    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone().unwrap_or(Command::Validate);
        let config = Self::from_args(args)?;
        Ok((config, command))
    }

    fn from_args(args: CliArgs) -> Result<Self> {
        let base_url = args
            .base_url
            .or_else(|| std::env::var("API_BASE_URL").ok())
            .context("API_BASE_URL is required (use -u or set API_BASE_URL env var)")?;

        let mut config = Self::with_base_url(&base_url);
        config.endpoints.auth_prefix = args.auth_prefix;
        config.endpoints.sessions_prefix = args.sessions_prefix;
        config.endpoints.progress_prefix = args.progress_prefix;

        if let Some(db_file) = args.db_file {
            config.token_db_file = expand_tilde(&db_file);
        }

        config.token_refresh_threshold = args.refresh_threshold;
        config.http_request_timeout = args.http_timeout;
        config.heartbeat_interval = args.heartbeat_interval;
        config.session_timeout = args.session_timeout;
        config.session_warning_window = args.warning_window;
        config.interactive_extension = args.interactive_extension;
        config.log_level = args.log_level;
        config.log_format = parse_log_format(&args.log_format);

        config.http_max_connections = args.http_max_connections;
        config.http_connect_timeout = args.http_connect_timeout;
        config.dedup_ttl = args.dedup_ttl;
        config.dedup_retry_count = args.dedup_retry_count;
        config.dedup_retry_delay_ms = args.dedup_retry_delay_ms;

        config.admin_username = args.admin_username;
        config.admin_password = args.admin_password;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let base_url = &self.endpoints.base_url;
        let parsed = reqwest::Url::parse(base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", base_url))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("API_BASE_URL must use http or https: {}", base_url);
        }

        if self.heartbeat_interval == 0 {
            anyhow::bail!("HEARTBEAT_INTERVAL must be greater than zero");
        }

        if self.session_warning_window >= self.session_timeout {
            anyhow::bail!(
                "SESSION_WARNING_WINDOW ({}) must be shorter than SESSION_TIMEOUT ({})",
                self.session_warning_window,
                self.session_timeout
            );
        }

        if self.admin_username.is_some() != self.admin_password.is_some() {
            anyhow::bail!("ADMIN_USERNAME and ADMIN_PASSWORD must be set together");
        }

        Ok(())
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.token_refresh_threshold)
    }

    pub fn heartbeat_settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_secs(self.heartbeat_interval),
            timeout: Duration::from_secs(self.session_timeout),
            warning_window: Duration::from_secs(self.session_warning_window),
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and no backend configured)
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();
    let has_base_url = std::env::var("API_BASE_URL").is_ok();

    !env_file_exists && !has_base_url
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub api_base_url: String,
    pub token_db_file: String,
}

/// Run interactive setup to collect required configuration
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("No configuration found. Let's point session-guard at your backend.");
    println!();

    let api_base_url: String = Input::new()
        .with_prompt("Backend base URL (API_BASE_URL)")
        .default("http://localhost:8080".to_string())
        .interact_text()
        .context("Failed to read API_BASE_URL")?;

    reqwest::Url::parse(&api_base_url)
        .with_context(|| format!("Not a valid URL: {}", api_base_url))?;

    let token_db_file: String = Input::new()
        .with_prompt("Token store location (TOKEN_DB_FILE)")
        .default(DEFAULT_DB_FILE.to_string())
        .interact_text()
        .context("Failed to read TOKEN_DB_FILE")?;

    let config = InteractiveConfig {
        api_base_url,
        token_db_file,
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!("✅ Configuration saved to .env file");
    }

    Ok(config)
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let env_content = format!(
        r#"# Session Guard Configuration
# Generated by interactive setup

# Backend base URL (required)
API_BASE_URL={}

# SQLite token store
TOKEN_DB_FILE={}

# Heartbeat settings (seconds)
HEARTBEAT_INTERVAL=60
SESSION_TIMEOUT=1800
SESSION_WARNING_WINDOW=300

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
"#,
        config.api_base_url, config.token_db_file,
    );

    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(env_content.as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
