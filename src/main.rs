//! trustctl - inspect, validate and enroll a trust provider

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trust_provider::{
    EnrollOutcome, SecurityProvider, backend,
    cli::{Cli, Command},
    config::{Platform, ProviderConfig},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = ProviderConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let provider = backend::from_config(&config, &Platform::detect())
        .with_context(|| format!("building the {} provider", config.provider))?;

    match cli.command {
        Command::Identity => {
            println!("Provider: {}", provider.kind());
            println!("Identity: {}", provider.identity());
            println!("Caller:   {}", provider.caller_name());
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate => Ok(run_validate(provider.as_ref())),
        Command::Enroll { max_wait } => {
            run_enroll(provider, max_wait.unwrap_or(config.enrollment.max_wait)).await
        }
        Command::Verify { certificate, name } => {
            let pem = std::fs::read(&certificate)
                .with_context(|| format!("reading {}", certificate.display()))?;
            provider.verify_certificate(&pem, &name)?;
            println!("✅ {} is trusted", certificate.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_validate(provider: &dyn SecurityProvider) -> ExitCode {
    let (errors, ok) = provider.validate();
    if ok {
        println!("✅ {} security for {} is valid", provider.kind(), provider.identity());
        return ExitCode::SUCCESS;
    }

    eprintln!("❌ {} problem(s) found:", errors.len());
    for error in &errors {
        eprintln!("   • {error}");
    }
    ExitCode::FAILURE
}

async fn run_enroll(
    provider: Arc<dyn SecurityProvider>,
    max_wait: Duration,
) -> anyhow::Result<ExitCode> {
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping enrollment");
            on_signal.cancel();
        }
    });

    info!(identity = %provider.identity(), max_wait = ?max_wait, "starting enrollment");

    let progress = |digest: &str, attempt: u32| {
        println!("Waiting for certificate (attempt {attempt}, request {digest})");
    };

    match provider.enroll(&cancel, max_wait, &progress).await? {
        EnrollOutcome::AlreadyEnrolled => {
            println!("✅ {} is already enrolled, nothing to do", provider.identity());
        }
        EnrollOutcome::Enrolled { attempts } => {
            println!(
                "✅ {} enrolled after {attempts} attempt(s)",
                provider.identity()
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}
