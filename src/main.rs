mod common;
mod config;
mod error;
mod ipmi;
mod layer2;
mod layer4;
mod power;
mod web;

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Cli, Config, Mode};
use crate::ipmi::IpmiController;
use crate::layer4::Layer4Listener;
use crate::power::PowerOrchestrator;

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Cli::parse();

    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(opts.log_level)
        .env()
        .init()
    {
        eprintln!("failed to initialize logger: {e}");
    }

    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(opts: Cli) -> Result<()> {
    let cfg = Config::load(&opts).context("invalid configuration")?;
    log::debug!("{cfg:?}");

    let controller = Arc::new(IpmiController::new(&cfg.bmc));
    let orchestrator = Arc::new(PowerOrchestrator::new(controller, cfg.bmc.timeout));

    if cfg.mode == Mode::Direct {
        log::info!("sending power on to {} for {}", cfg.bmc.host, cfg.target_mac);
        let outcome = orchestrator.trigger_power_on().await;
        if !outcome.is_success() {
            bail!("error executing IPMI command: {outcome}");
        }
        log::info!("{outcome}");
        return Ok(());
    }

    let cancel_token = CancellationToken::new();
    let sigint_token = cancel_token.clone();
    ctrlc::set_handler(move || {
        log::info!("received termination signal, shutting down");
        sigint_token.cancel();
    }).context("failed to install signal handler")?;

    let udp = Layer4Listener::bind(&cfg.layer4).await?;
    let http = web::bind(&cfg.web).await?;
    let app_state = web::AppState::new(orchestrator.clone(), &cfg.bmc.host)?;
    let l2 = if cfg.layer2.interfaces.is_empty() {
        None
    } else {
        Some(layer2::l2_worker(&cfg.layer2, cfg.target_mac, orchestrator.clone(), cancel_token.clone())?)
    };

    let udp = supervise("UDP listener", cancel_token.clone(),
        udp.run(cfg.target_mac, orchestrator, cancel_token.clone()));
    let http = supervise("web server", cancel_token.clone(),
        web::serve(http, app_state, cancel_token.clone()));

    // wait for workers
    let (udp, http) = tokio::join!(udp, http);
    cancel_token.cancel();
    if let Some(l2) = l2 {
        l2.join().await;
    }

    udp.context("UDP listener task failed")??;
    http.context("web server task failed")??;
    Ok(())
}

/// Spawns `fut` and takes every other worker down with it if it fails.
fn supervise<F>(name: &'static str, token: CancellationToken, fut: F) -> JoinHandle<Result<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let res = fut.await.with_context(|| format!("{name} stopped"));
        if res.is_err() {
            token.cancel();
        }
        res
    })
}
