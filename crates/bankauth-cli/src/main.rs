//! bankauth - terminal harness for the session manager.
//!
//! Drives `SessionManager` against a real backend so the login, refresh and
//! logout flows can be exercised without the mobile app.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bankauth_core::{AuthError, SessionConfig, SessionManager, SessionStatus};

/// Directory for a daily-rolling log file, in addition to stderr
const ENV_LOG_DIR: &str = "BANKAUTH_LOG_DIR";

const USAGE: &str = "\
Usage: bankauth <command>

Commands:
  login [email]   Sign in (prompts for the password)
  status          Restore the saved session and show it
  refresh         Restore the saved session and force a token refresh
  logout          Sign out on this device
  logout-all      Sign out on every device";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "bankauth.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let config = SessionConfig::load().context("Failed to load configuration")?;
    info!(api = %config.api_base_url, "bankauth starting");
    let manager =
        SessionManager::from_config(config).context("Failed to create HTTP transport")?;

    match command {
        "login" => login(&manager, args.get(1).cloned()).await,
        "status" => status(&manager).await,
        "refresh" => refresh(&manager).await,
        "logout" => {
            manager.initialize().await;
            manager.logout().await;
            println!("Signed out.");
            Ok(())
        }
        "logout-all" => {
            manager.initialize().await;
            manager.logout_all_devices().await;
            println!("Signed out on all devices.");
            Ok(())
        }
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

async fn login(manager: &Arc<SessionManager>, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    match manager.login(&email, &password).await {
        Ok(user) => {
            println!("Signed in as {}", user.display_name());
            print_expiry(manager).await;
            Ok(())
        }
        Err(e) => fail(e),
    }
}

async fn status(manager: &Arc<SessionManager>) -> Result<()> {
    if !manager.initialize().await {
        println!("Not signed in.");
        return Ok(());
    }
    let session = manager.session().await;
    match session.user() {
        Some(user) => println!("Signed in as {} <{}>", user.display_name(), user.email),
        None => println!("Signed in"),
    }
    println!("Status: {:?}", session.status());
    print_expiry(manager).await;
    Ok(())
}

async fn refresh(manager: &Arc<SessionManager>) -> Result<()> {
    if !manager.initialize().await {
        println!("Not signed in.");
        return Ok(());
    }
    match manager.force_refresh().await {
        Ok(_) => {
            println!("Token refreshed.");
            print_expiry(manager).await;
            Ok(())
        }
        Err(e) => fail(e),
    }
}

async fn print_expiry(manager: &SessionManager) {
    if manager.status() == SessionStatus::Authenticated {
        let remaining = manager.time_until_expiry().await;
        println!("Access token expires in {} min", remaining.num_minutes());
    }
}

fn fail(err: AuthError) -> Result<()> {
    eprintln!("{}", err.user_message());
    Err(err.into())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
