use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Method;

use daksh_session::auth::{resume, SessionTokenManager, SqliteTokenStore};
use daksh_session::config::{self, Command, Config};
use daksh_session::error::AuthError;
use daksh_session::http_client::{ApiRequest, SessionHttpClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level; stdout is reserved for command output
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        "Session database: {}, base URL: {}",
        config.session_db.display(),
        config.base_url
    );

    let store = SqliteTokenStore::open(&config.session_db)?;
    let manager =
        SessionTokenManager::new(store, config.base_url.clone(), config.token_refresh_skew)?;
    let http = SessionHttpClient::new(
        manager.clone(),
        config.http_connect_timeout,
        config.http_request_timeout,
    )?;

    match command {
        Command::Login { username, role } => login(&manager, username, role).await,
        Command::Status => status(&http).await,
        Command::Refresh => {
            manager
                .refresh_access_token()
                .await
                .map_err(with_login_hint)?;
            let tokens = manager.get_tokens();
            if let Some(exp) = tokens.access_token_expires_at {
                println!("Access token refreshed, expires {}", exp.to_rfc3339());
            }
            Ok(())
        }
        Command::Request { method, url, data } => request(&http, &method, url, data).await,
        Command::Logout => {
            http.logout().await;
            println!("Logged out");
            Ok(())
        }
        Command::Watch => watch(&manager).await,
    }
}

async fn login(
    manager: &SessionTokenManager,
    username: Option<String>,
    role: Option<daksh_session::auth::UserRole>,
) -> Result<()> {
    let prompt = config::prompt_login(username, role)?;

    let user = manager
        .login(&prompt.username, &prompt.password, Some(prompt.role))
        .await?;

    println!("Logged in as {}", prompt.username);
    if let Some(user) = user {
        println!("{}", serde_json::to_string_pretty(&user).unwrap_or_default());
    }
    Ok(())
}

async fn status(http: &SessionHttpClient) -> Result<()> {
    let manager = http.manager();
    let tokens = manager.get_tokens();
    let state = tokens.state_at(Utc::now(), manager.refresh_skew());

    println!("  Access token:  {}", state);
    if let Some(exp) = tokens.access_token_expires_at {
        println!("    expires:     {}", exp.to_rfc3339());
    }
    if let Some(exp) = tokens.refresh_token_expires_at {
        let label = if manager.is_refresh_token_expired() {
            "expired"
        } else {
            "valid"
        };
        println!("  Refresh token: {} (expires {})", label, exp.to_rfc3339());
    }

    manager.schedule_token_refresh();
    println!("{}", next_refresh_line(manager.scheduled_refresh_at()));

    if tokens.access_token.is_none() {
        println!();
        println!("Not logged in. Run `daksh-session login`.");
        return Ok(());
    }

    match http.check_session().await {
        Some(user) => {
            println!();
            println!("{}", serde_json::to_string_pretty(&user).unwrap_or_default());
        }
        None => {
            println!();
            println!("Server did not accept the session. Run `daksh-session login`.");
        }
    }
    Ok(())
}

async fn request(
    http: &SessionHttpClient,
    method: &str,
    url: String,
    data: Option<String>,
) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;

    let mut request = ApiRequest::new(method, url);
    if let Some(data) = data {
        let body: serde_json::Value =
            serde_json::from_str(&data).context("--data must be valid JSON")?;
        request = request.json(body);
    }

    let response = http.api_request(request).await.map_err(with_login_hint)?;

    eprintln!("HTTP {}", response.status());
    match response.json::<serde_json::Value>() {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default()),
        Err(_) => println!("{}", response.text()),
    }

    if !response.is_success() {
        anyhow::bail!("Request failed with status {}", response.status());
    }
    Ok(())
}

async fn watch(manager: &SessionTokenManager) -> Result<()> {
    let listener = manager.initialize(resume::foreground_events()?);

    match manager.scheduled_refresh_at() {
        Some(at) => tracing::info!("Watching session, next refresh at {}", at.to_rfc3339()),
        None => tracing::warn!("No session stored; run `daksh-session login` first"),
    }

    shutdown_signal().await;
    listener.abort();

    tracing::info!("Stopped watching session");
    Ok(())
}

fn next_refresh_line(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => format!("  Next refresh:  {}", at.to_rfc3339()),
        None => "  Next refresh:  not scheduled".to_string(),
    }
}

/// Point the user at `login` when the session cannot be recovered
fn with_login_hint(err: AuthError) -> anyhow::Error {
    if err.requires_login() {
        anyhow::anyhow!("{}. Run `daksh-session login` to start a new session.", err)
    } else {
        anyhow::Error::new(err)
    }
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_refresh_line() {
        let at = DateTime::parse_from_rfc3339("2030-01-01T00:10:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            next_refresh_line(Some(at)),
            "  Next refresh:  2030-01-01T00:10:00+00:00"
        );
        assert_eq!(next_refresh_line(None), "  Next refresh:  not scheduled");
    }

    #[test]
    fn test_login_hint_only_for_unrecoverable_errors() {
        let err = with_login_hint(AuthError::SessionExpired);
        assert!(err.to_string().contains("daksh-session login"));

        let err = with_login_hint(AuthError::Transport {
            message: "connection refused".to_string(),
        });
        assert!(!err.to_string().contains("daksh-session login"));
    }
}
