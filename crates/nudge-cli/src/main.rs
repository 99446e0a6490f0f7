//! nudge - command-line shell for the nudge reminder/inventory tracker.
//!
//! Drives the client core end to end: login/logout, identity confirmation,
//! and raw authenticated GETs against the backend API.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nudge_core::api::Gateway;
use nudge_core::auth::{CredentialStore, SessionContext, SessionState};
use nudge_core::config::Config;

/// Token file name in the data directory
const TOKEN_FILE: &str = "tokens.json";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn usage() -> ! {
    eprintln!("Usage: nudge <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  login [username]   Sign in and store the session");
    eprintln!("  whoami             Show the signed-in user");
    eprintln!("  logout             Drop the stored session");
    eprintln!("  get <path>         Authenticated GET against the API");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("");

    let mut config = Config::load()?;
    let store = Arc::new(CredentialStore::open(Config::data_dir()?.join(TOKEN_FILE))?);
    let gateway = Gateway::new(config.api_base_url(), Arc::clone(&store))?;
    let session = SessionContext::new(gateway.clone(), Arc::clone(&store));
    info!(base_url = %config.api_base_url(), "nudge CLI starting");

    match command {
        "login" => {
            let username = match args.get(2) {
                Some(name) => name.clone(),
                None => prompt_username(config.last_username.as_deref())?,
            };
            let password = rpassword::prompt_password("Password: ")?;

            session.login(&username, &password).await?;
            config.last_username = Some(username.clone());
            config.save()?;
            println!("Logged in as {}.", username);
        }
        "whoami" => {
            if !store.has_session() {
                println!("Not logged in.");
                return Ok(());
            }
            session.confirm().await;
            match session.state() {
                SessionState::Authenticated(user) => {
                    println!("{} (id {})", user.username, user.id);
                    if let Some(email) = user.email {
                        println!("  email:    {}", email);
                    }
                    if let Some(timezone) = user.timezone {
                        println!("  timezone: {}", timezone);
                    }
                }
                _ if store.has_session() => {
                    // Tokens survived, so the failure was transient.
                    println!("Could not confirm the session (backend unreachable?).");
                }
                _ => println!("Session expired. Run `nudge login` to sign in again."),
            }
        }
        "logout" => {
            session.logout();
            println!("Logged out.");
        }
        "get" => {
            let path = args.get(2).map(String::as_str).unwrap_or_else(|| usage());
            let mut events = gateway.subscribe();
            let response = gateway.get(path).await?;
            let status = response.status();
            let body = response.text().await?;
            println!("{}", status);
            if !body.is_empty() {
                println!("{}", body);
            }
            if events.try_recv().is_ok() {
                eprintln!("Session expired; run `nudge login` to sign in again.");
            }
        }
        _ => usage(),
    }

    Ok(())
}

fn prompt_username(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Username [{}]: ", last),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let trimmed = input.trim();
    if trimmed.is_empty() {
        if let Some(last) = last {
            return Ok(last.to_string());
        }
        anyhow::bail!("Username required");
    }
    Ok(trimmed.to_string())
}
