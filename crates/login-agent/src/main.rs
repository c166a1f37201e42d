//! login-agent — sign in to a CAPTCHA-gated backend from the command line.
//!
//! ```bash
//! LOGIN_USERNAME=alice LOGIN_PASSWORD=... login-agent --backend-url https://portal.example/ login
//! login-agent captcha --save captcha.png
//! login-agent solve captcha.png
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use login_agent::config::{ENV_PASSWORD, ENV_USERNAME};
use login_agent::{
    append_telemetry, ControllerConfig, Credentials, HttpBackend, LoginAttemptController,
    LoginConfig, LoginOutcome, SessionBroker,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides LOGIN_BACKEND_URL)
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Path to the tesseract binary (overrides LOGIN_TESSERACT_BIN)
    #[arg(long, global = true)]
    tesseract: Option<String>,

    /// Append sequence metrics as JSON lines to this file
    #[arg(long, global = true)]
    telemetry: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in, retrying CAPTCHA guesses until the backend decides
    Login {
        /// Username (defaults to LOGIN_USERNAME)
        #[arg(long)]
        username: Option<String>,

        /// Password (defaults to LOGIN_PASSWORD)
        #[arg(long)]
        password: Option<String>,

        /// Session fetch budget, 0 for unbounded (overrides LOGIN_MAX_ITERATIONS)
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Print the sequence metrics as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Fetch one CAPTCHA and print the solver's guess
    Captcha {
        /// Also write the image here
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Solve a CAPTCHA image from disk, no network
    Solve { image: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = LoginConfig::load(args.config.as_deref())?;
    if let Some(url) = args.backend_url {
        config.backend_url = url;
    }
    if let Some(bin) = args.tesseract {
        config.ocr.tesseract_bin = bin;
    }

    match args.command {
        Command::Login {
            username,
            password,
            max_iterations,
            json,
        } => {
            if let Some(max) = max_iterations {
                config.max_iterations = max;
            }
            let username = username
                .or_else(|| std::env::var(ENV_USERNAME).ok())
                .context(format!("no username: pass --username or set {ENV_USERNAME}"))?;
            let password = password
                .or_else(|| std::env::var(ENV_PASSWORD).ok())
                .context(format!("no password: pass --password or set {ENV_PASSWORD}"))?;
            let credentials = Credentials::new(username, password);

            info!(backend = %config.backend_url, "starting login");
            let backend = Arc::new(HttpBackend::new(&config)?);
            let controller = LoginAttemptController::over_http(
                backend,
                Arc::new(config.build_solver()),
                ControllerConfig::from(&config),
            );

            let report = controller.login(&credentials).await;
            if let Some(path) = &args.telemetry {
                append_telemetry(&report.metrics, path);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&report.metrics)?);
            }
            println!("{}", report.outcome.user_message());

            match report.outcome {
                LoginOutcome::Succeeded { session, .. } => {
                    info!(token = %session.redacted(), "session established");
                    Ok(())
                }
                other => bail!("login {}", other.label()),
            }
        }
        Command::Captcha { save } => {
            let backend = HttpBackend::new(&config)?;
            let image = backend
                .fetch_fresh()
                .await
                .map_err(|kind| anyhow::anyhow!("captcha fetch failed: {kind}"))?;
            if let Some(path) = save {
                std::fs::write(&path, &image.bytes)
                    .context(format!("Failed to write {}", path.display()))?;
                info!(path = %path.display(), "saved captcha");
            }
            let report = config.build_solver().solve(&image.bytes).await;
            println!(
                "{}\t{}",
                report.guess().unwrap_or("-"),
                image.session.redacted()
            );
            Ok(())
        }
        Command::Solve { image } => {
            let bytes =
                std::fs::read(&image).context(format!("Failed to read {}", image.display()))?;
            let report = config.build_solver().solve(&bytes).await;
            for candidate in &report.candidates {
                println!("{}\t{}", candidate.variant, candidate.text);
            }
            match report.guess() {
                Some(guess) => {
                    println!("{guess}");
                    Ok(())
                }
                None => bail!("no usable guess from {} variants", report.variants.len()),
            }
        }
    }
}
