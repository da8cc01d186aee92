use std::sync::Arc;

use anyhow::Context;
use env_logger::Env;
use kube::config::{KubeConfigOptions, Kubeconfig};
use log::{error, info};
use tokio_util::sync::CancellationToken;

mod agent;
mod config;
mod controller;
mod error;
mod fleet;
mod launcher;
mod node;
mod pods;
mod provider;
mod retry;
mod server;
mod state;
#[cfg(test)]
mod test_support;

use config::{Commands, Config};
use controller::ControllerClient;
use fleet::FleetSupervisor;
use launcher::KubeLauncher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new_from_flags();
    if let Some(Commands::Version) = config.command {
        println!("fog-kubelet {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    env_logger::Builder::from_env(Env::default().default_filter_or(config.log_level.as_str())).init();

    let kubeconfig = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => kube::Config::infer().await?,
    };
    let client = kube::Client::try_from(kubeconfig)?;
    let controller = Arc::new(ControllerClient::new(config.controller_url(), config.controller_token())?);

    let root = CancellationToken::new();
    let launcher = KubeLauncher::new(config.clone(), client, controller.clone());
    let (supervisor, fleet) = FleetSupervisor::new(Arc::new(launcher), root.clone());
    let supervisor = tokio::spawn(supervisor.run());

    let listener = tokio::net::TcpListener::bind(config.control_addr)
        .await
        .with_context(|| format!("binding control server to {}", config.control_addr))?;
    let server = tokio::spawn(server::serve(listener, fleet.clone(), root.clone()));
    let poller = tokio::spawn(fleet::poll_devices(
        controller,
        fleet.clone(),
        fleet::POLL_INTERVAL,
        root.clone(),
    ));

    info!(
        "fog-kubelet {} managing devices of {}",
        env!("CARGO_PKG_VERSION"),
        config.controller_url()
    );
    shutdown_signal().await;
    info!("shutting down, nodes are left registered");
    match fleet.snapshot().await {
        Ok(active) => info!("stopping agents for devices {:?}", active.keys().collect::<Vec<_>>()),
        Err(e) => error!("Error listing agents: {}", e),
    }

    if let Err(e) = fleet.shutdown().await {
        error!("Error stopping agents: {}", e);
        root.cancel();
    }
    supervisor.await?;
    poller.await?;
    server.await??;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error listening for ctrl-c: {}", e);
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Error listening for SIGTERM: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
