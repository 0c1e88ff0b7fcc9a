use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;

use session_guard::config::{self, Command, Config, LogFormat};
use session_guard::events::SessionEvent;
use session_guard::AuthContext;

#[tokio::main]
async fn main() -> Result<()> {
    // Check if interactive setup is needed (no .env and no backend configured)
    if config::needs_interactive_setup() {
        let interactive_config = config::run_interactive_setup()?;

        // Set environment variables from interactive config so Config::load() can use them
        std::env::set_var("API_BASE_URL", &interactive_config.api_base_url);
        std::env::set_var("TOKEN_DB_FILE", &interactive_config.token_db_file);
    }

    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    init_tracing(&config);

    tracing::info!("Session Guard starting...");
    tracing::info!(base_url = %config.endpoints.base_url, "Backend configured");
    tracing::debug!(token_db_file = %config.token_db_file.display(), "Token store location");

    let context = AuthContext::from_config(&config)?;

    match command {
        Command::Login { username, password } => login(&context, &username, password).await,
        Command::Profile => profile(&context).await,
        Command::Validate => validate(&context).await,
        Command::Study {
            course,
            module,
            lesson,
        } => study(&context, &course, &module, &lesson).await,
        Command::Logout => {
            context.account().logout();
            println!("Signed out");
            Ok(())
        }
    }
}

/// Initialize logging with the configured level and format
fn init_tracing(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn login(context: &AuthContext, username: &str, password: Option<String>) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => dialoguer::Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password")?,
    };

    let credential = context
        .account()
        .login(username, &password)
        .await
        .context("Login failed")?;

    match credential.expires_at {
        Some(expires_at) => println!("Signed in as {} (credential valid until {})", username, expires_at),
        None => println!("Signed in as {}", username),
    }
    Ok(())
}

async fn profile(context: &AuthContext) -> Result<()> {
    let profile = context
        .account()
        .profile()
        .await
        .context("Failed to load profile")?;

    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

async fn validate(context: &AuthContext) -> Result<()> {
    let valid = context
        .account()
        .validate()
        .await
        .context("Failed to validate credentials")?;

    if valid {
        println!("Credentials are valid");
    } else {
        println!("Credentials are no longer accepted, run `session-guard login`");
    }
    Ok(())
}

/// Keep a heartbeat session alive until Ctrl-C or expiry
async fn study(context: &AuthContext, course: &str, module: &str, lesson: &str) -> Result<()> {
    let mut events = context.events().subscribe();
    let tracker = context.heartbeat_tracker();

    let session = tracker
        .start(course, module, lesson)
        .await
        .context("Failed to start study session")?;
    println!("Study session {} started (Ctrl-C to stop)", session.session_id);

    let user_id = context
        .account()
        .profile()
        .await
        .map(|profile| profile.username)
        .context("Failed to load profile")?;
    let progress = context.progress();
    if let Err(e) = progress.initialize_module(&user_id, course, module).await {
        tracing::warn!(error = %e, "Module progress could not be initialized");
    }
    let completed = progress.completed_items(&user_id, course).await;
    println!("{} item(s) completed in this course", completed.len());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, ending study session");
                tracker.unload();
                // Give the end notice a chance to leave before the runtime stops
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::HeartbeatWarning { expires_in, .. }) => {
                    println!("Your session expires in {}s without activity", expires_in.as_secs());
                }
                Ok(SessionEvent::HeartbeatExpired { message, .. }) => {
                    println!("{}", message);
                    return Ok(());
                }
                Ok(SessionEvent::LoginRequired { reason, .. }) => {
                    println!("Signed out ({}), run `session-guard login`", reason);
                    tracker.unload();
                    return Ok(());
                }
                Ok(event) => tracing::debug!(event = ?event, "Session event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Session events dropped");
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}
