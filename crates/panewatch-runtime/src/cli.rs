//! CLI definition using clap derive.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "panewatch", version, about = "Live status of coding agents running in tmux")]
pub struct Cli {
    /// Hook socket path (default: $XDG_RUNTIME_DIR/panewatch/hook.sock)
    #[arg(long, global = true, env = "PANEWATCH_HOOK_SOCKET")]
    pub hook_socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon (pollers, hook socket, WebSocket server)
    Daemon(DaemonOpts),
    /// Forward one agent hook payload from stdin to the daemon
    Hook(HookOpts),
    /// Install hook commands into the agent's settings.json
    SetupHooks(SetupHooksOpts),
}

#[derive(clap::Args)]
pub struct DaemonOpts {
    /// WebSocket listen address
    #[arg(long, env = "PANEWATCH_WS_ADDR", default_value = "127.0.0.1:7681")]
    pub ws_addr: SocketAddr,

    /// tmux server socket path (-S)
    #[arg(long, env = "PANEWATCH_TMUX_SOCKET_PATH")]
    pub tmux_socket: Option<String>,

    /// Directory of pattern TOML files replacing the builtin set
    #[arg(long)]
    pub patterns_dir: Option<PathBuf>,

    /// Append every status transition to this JSONL file
    #[arg(long)]
    pub record: Option<PathBuf>,

    /// Tunables file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Poll only; do not attach a control-mode client
    #[arg(long)]
    pub no_control_mode: bool,

    /// Maximum concurrent WebSocket clients
    #[arg(long, default_value_t = 64)]
    pub max_connections: usize,
}

#[derive(clap::Args)]
pub struct HookOpts {
    /// Hook event name, e.g. PreToolUse
    pub event: String,
}

#[derive(clap::Args)]
pub struct SetupHooksOpts {
    /// Settings scope: "user" (~/.claude) or "project" (./.claude)
    #[arg(long, default_value = "user")]
    pub scope: String,

    /// panewatch binary the hooks invoke (default: this executable)
    #[arg(long)]
    pub binary: Option<String>,
}

/// Default hook socket path using $USER for per-user isolation.
pub fn default_hook_socket() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(format!("{dir}/panewatch/hook.sock"));
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/panewatch-{user}/hook.sock"))
}
