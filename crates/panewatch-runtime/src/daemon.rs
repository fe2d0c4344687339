//! Daemon wiring: one task per loop, one cancellation token for all of them.

use std::path::Path;
use std::sync::Arc;

use panewatch_core::PatternRegistry;
use panewatch_tmux::TmuxExecutor;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::capture_scheduler::CaptureScheduler;
use crate::cli::DaemonOpts;
use crate::config::{DaemonConfig, ms};
use crate::control::Controller;
use crate::control_monitor::ControlMonitor;
use crate::hook_server::{HookServer, remove_socket};
use crate::reconciler::Reconciler;
use crate::recorder::Recorder;
use crate::topology_poller::TopologyPoller;
use crate::ws_server::{ClientHub, WsServer};

pub async fn run_daemon(opts: DaemonOpts, hook_socket: &Path) -> anyhow::Result<()> {
    let config = match &opts.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };

    let patterns = Arc::new(PatternRegistry::builtin());
    if let Some(dir) = &opts.patterns_dir {
        let loaded = patterns.load_dir(dir)?;
        let current = patterns.current();
        tracing::info!(
            dir = %dir.display(),
            loaded,
            name = current.name(),
            version = current.version(),
            "pattern sets loaded"
        );
    }

    let executor = Arc::new(build_executor(&opts));
    let cancel = CancellationToken::new();
    let broadcaster = Arc::new(Broadcaster::new(config.backpressure.clone()));
    let reconciler = Arc::new(Reconciler::new(&config, Arc::clone(&patterns), Arc::clone(&broadcaster)));

    let mut poller = TopologyPoller::new(
        Arc::clone(&executor),
        Arc::clone(&reconciler),
        Arc::clone(&broadcaster),
        config.topology.clone(),
    );
    let topology_wake = poller.wake_handle();
    let control_active = poller.control_flag();
    // Populate topology before clients can connect.
    if let Err(e) = poller.tick().await {
        tracing::warn!(error = %e, "initial topology poll failed");
    }

    let scheduler = CaptureScheduler::new(
        Arc::clone(&executor),
        Arc::clone(&reconciler),
        Arc::clone(&broadcaster),
        config.capture.clone(),
        Arc::clone(&topology_wake),
    );
    let hints = scheduler.hints();

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(poller.run(cancel.clone()));
    tasks.spawn(scheduler.run(cancel.clone()));
    tasks.spawn(
        Arc::clone(&reconciler).run_recheck(ms(config.reconcile.recheck_interval_ms), cancel.clone()),
    );

    if opts.no_control_mode {
        tracing::info!("control mode disabled, polling only");
    } else {
        let monitor = ControlMonitor::new(
            &executor,
            Arc::clone(&hints),
            Arc::clone(&topology_wake),
            control_active,
        );
        tasks.spawn(monitor.run(cancel.clone()));
    }

    if let Some(path) = &opts.record {
        let recorder = Recorder::new(path, reconciler.subscribe_transitions(), cancel.clone())?;
        tracing::info!(path = %path.display(), "recording transitions");
        tasks.spawn(recorder.run());
    }

    let hook_server = HookServer::new(hook_socket.to_path_buf(), Arc::clone(&reconciler));
    let hook_listener = hook_server.bind().await?;
    tasks.spawn(hook_server.serve(hook_listener, cancel.clone()));

    let controller = Arc::new(Controller::new(
        Arc::clone(&executor),
        Arc::clone(&broadcaster),
        hints,
        topology_wake,
    ));
    let hub = ClientHub {
        reconciler,
        broadcaster,
        controller,
    };
    let ws = WsServer::new(opts.ws_addr, hub, cancel.clone()).with_max_connections(opts.max_connections);
    let (listener, addr) = ws.bind().await?;
    tasks.spawn(async move {
        if let Err(e) = ws.serve(listener).await {
            tracing::error!("ws server error: {e}");
        }
    });

    tracing::info!(ws = %addr, hook_socket = %hook_socket.display(), "panewatch daemon running");

    tokio::select! {
        result = shutdown_signal() => result?,
        _ = tasks.join_next() => {
            tracing::warn!("a daemon task exited unexpectedly");
        }
    }

    cancel.cancel();
    while tasks.join_next().await.is_some() {}
    remove_socket(hook_socket);
    tracing::info!("daemon stopped");
    Ok(())
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
        tracing::info!("received ctrl-c, shutting down");
    }

    Ok(())
}

fn build_executor(opts: &DaemonOpts) -> TmuxExecutor {
    let mut executor = TmuxExecutor::default();

    // Socket targeting: --tmux-socket > PANEWATCH_TMUX_SOCKET_PATH > PANEWATCH_TMUX_SOCKET_NAME
    if let Some(ref socket) = opts.tmux_socket {
        executor = executor.with_socket_path(socket.clone());
    } else if let Ok(name) = std::env::var("PANEWATCH_TMUX_SOCKET_NAME") {
        executor = executor.with_socket_name(name);
    }

    executor
}
