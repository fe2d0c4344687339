//! panewatch: live status of coding agents running in tmux panes.
//! Single-process daemon plus the hook forwarder and hook installer.

use clap::Parser;

mod broadcast;
mod capture_scheduler;
mod cli;
mod config;
mod control;
mod control_monitor;
mod daemon;
mod hook_forward;
mod hook_server;
mod messages;
mod reconciler;
mod recorder;
mod setup_hooks;
mod topology_poller;
mod ws_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let hook_socket = args.hook_socket.unwrap_or_else(cli::default_hook_socket);

    match args.command {
        cli::Command::Daemon(opts) => {
            let filter = std::env::var("PANEWATCH_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .init();

            tracing::info!(version = env!("CARGO_PKG_VERSION"), "panewatch daemon starting");
            daemon::run_daemon(opts, &hook_socket).await?;
        }
        cli::Command::Hook(opts) => {
            hook_forward::run_hook(&opts.event, &hook_socket).await;
        }
        cli::Command::SetupHooks(opts) => {
            let path = setup_hooks::apply_hooks(&opts)?;
            println!("hooks written to {}", path.display());
        }
    }

    Ok(())
}
