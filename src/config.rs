use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password, Select};
use reqwest::Url;
use std::path::PathBuf;

use crate::auth::{UserRole, MAX_REFRESH_SKEW_SECS};

/// Daksh session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Daksh platform base URL
    #[arg(short = 'u', long, env = "DAKSH_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// Path to the session SQLite database
    #[arg(short = 'd', long, env = "DAKSH_SESSION_DB", global = true)]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60", global = true)]
    pub http_timeout: u64,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and store a new session
    Login {
        /// Username (prompted if omitted)
        #[arg(long)]
        username: Option<String>,

        /// Role to log in as (prompted if omitted)
        #[arg(long, value_enum)]
        role: Option<UserRole>,
    },

    /// Show the stored session and ask the server who it belongs to
    Status,

    /// Force an access token refresh
    Refresh,

    /// Send an authenticated request and print the response
    Request {
        /// HTTP method
        method: String,

        /// Absolute URL or path such as /api/classes
        url: String,

        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },

    /// End the session on the server and clear local tokens
    Logout,

    /// Keep the session fresh in the background until interrupted
    Watch,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Platform
    pub base_url: Url,
    pub session_db: PathBuf,

    // Token lifecycle
    pub token_refresh_skew: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args)?;
        Ok((config, args.command))
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let base_url = args
            .base_url
            .clone()
            .context("DAKSH_BASE_URL is required (use -u or set DAKSH_BASE_URL env var)")?;

        let config = Config {
            base_url: parse_base_url(&base_url)?,

            session_db: args
                .db_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_session_db),

            token_refresh_skew: env_or("TOKEN_REFRESH_SKEW", 300),

            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 30),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level.clone(),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.base_url.scheme(), "http" | "https") {
            anyhow::bail!(
                "DAKSH_BASE_URL must be an http(s) URL: {}",
                self.base_url
            );
        }

        if self.token_refresh_skew > MAX_REFRESH_SKEW_SECS {
            anyhow::bail!(
                "TOKEN_REFRESH_SKEW must be at most {} seconds, got {}",
                MAX_REFRESH_SKEW_SECS,
                self.token_refresh_skew
            );
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }
}

/// Parse an optional numeric environment variable
fn env_or(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parse the base URL; a trailing slash is added so paths join under it
fn parse_base_url(s: &str) -> Result<Url> {
    let normalized = if s.ends_with('/') {
        s.to_string()
    } else {
        format!("{}/", s)
    };
    Url::parse(&normalized).with_context(|| format!("Invalid DAKSH_BASE_URL: {}", s))
}

/// Default session database location: ~/.daksh/session.sqlite3
fn default_session_db() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".daksh").join("session.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("session.sqlite3"))
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

// === Interactive Login ===

/// Credentials collected for a login
#[derive(Clone)]
pub struct LoginPrompt {
    pub username: String,
    pub password: String,
    pub role: UserRole,
}

/// Prompt for whatever login details were not given on the command line
pub fn prompt_login(username: Option<String>, role: Option<UserRole>) -> Result<LoginPrompt> {
    let username = match username {
        Some(username) => username,
        None => Input::new()
            .with_prompt("Username")
            .interact_text()
            .context("Failed to read username")?,
    };

    let password: String = Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password")?;

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    let role = match role {
        Some(role) => role,
        None => {
            let roles = [
                UserRole::Student,
                UserRole::Mentor,
                UserRole::Admin,
                UserRole::SuperAdmin,
            ];
            let labels = ["Student", "Mentor", "Admin", "Super admin"];
            let idx = Select::new()
                .with_prompt("Log in as")
                .items(&labels)
                .default(0)
                .interact()
                .context("Failed to read role selection")?;
            roles[idx]
        }
    };

    Ok(LoginPrompt {
        username,
        password,
        role,
    })
}
