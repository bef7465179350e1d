//! hevy-broker - operator command line for the Hevy credential broker.
//!
//! Performs brokered logins (challenge token via headless Chromium), keeps the
//! resulting token pair in the OS keychain, and runs data calls with either the
//! stored session or a PRO API key from `HEVY_API_KEY`.

mod store;

use std::io;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use hevy_broker_core::api::query::DEFAULT_PAGE_SIZE;
use hevy_broker_core::{
    ApiError, BearerCredential, BrokerConfig, HevyBroker, PresentedCredentials, TokenSession,
    UpstreamClient, WorkoutQuery,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use store::SessionStore;

/// Log file prefix inside the log directory
const LOG_FILE_PREFIX: &str = "hevy-broker.log";

const USAGE: &str = "\
Usage: hevy-broker <command> [options]

Commands:
  login <email-or-username>       Log in and store the session in the keychain
  refresh                         Refresh the stored session
  logout                          Delete the stored session
  account                         Show the account of the stored session
  workouts [--offset N] [--username U] [--page N] [--page-size M]
                                  Fetch one page of workouts
  measurements                    List body measurements
  measurements add <YYYY-MM-DD> <kg>
                                  Record a body weight
  validate-key <api-key>          Check a PRO API key

HEVY_API_KEY, when set, is used instead of the stored session.
Configuration is read from the environment and an optional .env file.";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr (filtered by `RUST_LOG`, default `warn`) and to a daily
/// file under the user cache directory when one is available.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match dirs::cache_dir() {
        Some(dir) => {
            let appender =
                tracing_appender::rolling::daily(dir.join("hevy-broker").join("logs"), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
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
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };
    if command == "--help" || command == "-h" || command == "help" {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = BrokerConfig::from_env()?;
    debug!(?config, "Loaded configuration");
    let broker = HevyBroker::new(config)?;
    info!(command = %command, "hevy-broker starting");

    let rest = &args[1..];
    let result = match command.as_str() {
        "login" => login(&broker, rest).await,
        "refresh" => refresh(&broker).await,
        "logout" => logout(),
        "account" => account(&broker).await,
        "workouts" => workouts(&broker, rest).await,
        "measurements" => measurements(&broker, rest).await,
        "validate-key" => validate_key(&broker, rest).await,
        other => Err(anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    };

    broker.shutdown().await;
    result
}

async fn login(broker: &HevyBroker, args: &[String]) -> Result<()> {
    let identifier = args
        .first()
        .ok_or_else(|| anyhow!("Usage: hevy-broker login <email-or-username>"))?;
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    eprintln!("Obtaining challenge token...");
    let mut session = TokenSession::new();
    let credential = broker
        .login_session(&mut session, identifier, &password)
        .await?;
    SessionStore::save(&credential)?;

    eprintln!(
        "Logged in as {}{}",
        identifier,
        describe_expiry(&credential)
    );
    Ok(())
}

async fn refresh(broker: &HevyBroker) -> Result<()> {
    let stored = require_session()?;
    let mut session = TokenSession::resume(stored.clone());

    match broker.refresh_session(&mut session).await {
        Ok(credential) => {
            SessionStore::save(&carry_identity(credential.clone(), &stored))?;
            eprintln!("Session refreshed{}", describe_expiry(&credential));
            Ok(())
        }
        Err(ApiError::InvalidRefreshToken) => {
            SessionStore::delete()?;
            bail!("Refresh token rejected; stored session removed. Run `hevy-broker login` again.")
        }
        Err(e) => Err(e.into()),
    }
}

fn logout() -> Result<()> {
    if SessionStore::delete()? {
        eprintln!("Stored session deleted");
    } else {
        eprintln!("No stored session");
    }
    Ok(())
}

async fn account(broker: &HevyBroker) -> Result<()> {
    let (client, _) = client(broker).await?;
    print_json(&broker.fetch_account(&client).await?)
}

async fn workouts(broker: &HevyBroker, args: &[String]) -> Result<()> {
    let (client, session) = client(broker).await?;

    let query = if client.mode().is_pro() {
        let page = parse_flag(args, "--page")?.unwrap_or(1);
        let page_size = parse_flag(args, "--page-size")?.unwrap_or(DEFAULT_PAGE_SIZE);
        WorkoutQuery::page(page, page_size)
    } else {
        let offset = parse_flag(args, "--offset")?.unwrap_or(0);
        let username = flag(args, "--username")
            .map(str::to_string)
            .or_else(|| session.and_then(|c| c.username))
            .ok_or_else(|| anyhow!("--username is required (the stored session has none)"))?;
        WorkoutQuery::offset(offset, username)
    };

    print_json(&broker.fetch_workouts(&client, &query).await?)
}

async fn measurements(broker: &HevyBroker, args: &[String]) -> Result<()> {
    let (client, _) = client(broker).await?;

    match args.first().map(String::as_str) {
        None => print_json(&broker.fetch_body_measurements(&client).await?),
        Some("add") => {
            let (Some(date), Some(weight)) = (args.get(1), args.get(2)) else {
                bail!("Usage: hevy-broker measurements add <YYYY-MM-DD> <kg>");
            };
            let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .with_context(|| format!("Invalid date: {}", date))?;
            let weight_kg: f64 = weight
                .parse()
                .with_context(|| format!("Invalid weight: {}", weight))?;
            broker.post_body_measurement(&client, date, weight_kg).await?;
            eprintln!("Recorded {} kg for {}", weight_kg, date);
            Ok(())
        }
        Some(other) => bail!("Unknown measurements subcommand: {}", other),
    }
}

async fn validate_key(broker: &HevyBroker, args: &[String]) -> Result<()> {
    let key = args
        .first()
        .ok_or_else(|| anyhow!("Usage: hevy-broker validate-key <api-key>"))?;
    if broker.validate_api_key(key).await? {
        println!("valid");
    } else {
        println!("invalid");
    }
    Ok(())
}

/// Resolve the client for data calls: `HEVY_API_KEY` wins, otherwise the
/// stored session, refreshed first when it is about to expire.
async fn client(broker: &HevyBroker) -> Result<(UpstreamClient, Option<BearerCredential>)> {
    let api_key = std::env::var("HEVY_API_KEY").ok();
    let stored = SessionStore::load()?;

    let credential = match (&api_key, stored) {
        (Some(_), stored) => stored,
        (None, Some(stored)) => Some(ensure_fresh(broker, stored).await?),
        (None, None) => None,
    };

    let presented = PresentedCredentials {
        bearer_token: credential.as_ref().map(|c| c.access_token.clone()),
        refresh_token: credential.as_ref().map(|c| c.refresh_token.clone()),
        api_key,
    };
    let client = broker.resolve_client(&presented).map_err(|e| match e {
        ApiError::MissingCredentials => {
            anyhow!("Not logged in. Run `hevy-broker login` or set HEVY_API_KEY.")
        }
        other => other.into(),
    })?;
    debug!(mode = client.mode().name(), "Using upstream client");
    Ok((client, credential))
}

async fn ensure_fresh(broker: &HevyBroker, stored: BearerCredential) -> Result<BearerCredential> {
    let mut session = TokenSession::resume(stored.clone());
    match broker.refresh_session_if_needed(&mut session).await {
        Ok(Some(credential)) => {
            let credential = carry_identity(credential, &stored);
            SessionStore::save(&credential)?;
            info!("Stored session refreshed before expiry");
            Ok(credential)
        }
        Ok(None) => Ok(stored),
        Err(ApiError::InvalidRefreshToken) => {
            SessionStore::delete()?;
            bail!("Session expired; stored session removed. Run `hevy-broker login` again.")
        }
        Err(e) => {
            warn!(error = %e, "Refresh before expiry failed, using stored token");
            Ok(stored)
        }
    }
}

fn require_session() -> Result<BearerCredential> {
    SessionStore::load()?.ok_or_else(|| anyhow!("Not logged in. Run `hevy-broker login` first."))
}

/// Refresh responses carry no identity; keep what login recorded.
fn carry_identity(mut credential: BearerCredential, previous: &BearerCredential) -> BearerCredential {
    credential.user_id = credential.user_id.or_else(|| previous.user_id.clone());
    credential.username = credential.username.or_else(|| previous.username.clone());
    credential.email = credential.email.or_else(|| previous.email.clone());
    credential
}

fn describe_expiry(credential: &BearerCredential) -> String {
    match credential.expires_at {
        Some(at) => format!(" (expires {})", at.format("%Y-%m-%d %H:%M UTC")),
        None => String::new(),
    }
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parse_flag(args: &[String], name: &str) -> Result<Option<u32>> {
    flag(args, name)
        .map(|v| v.parse().with_context(|| format!("Invalid value for {}: {}", name, v)))
        .transpose()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
