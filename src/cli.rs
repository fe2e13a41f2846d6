//! Command line interface.
//!
//! `nearcast run` joins the mesh on the local network and reads commands from
//! stdin:
//!
//! ```text
//! play <id> <title> <artist> [album]   share a track ('quote' words with spaces)
//! stop                                 clear the local track
//! bg | fg                              simulate app background/foreground
//! peers                                print the peer table
//! help
//! quit
//! ```
//!
//! Lines are split with shell quoting rules and parsed by [`ReplCli`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::config::MeshConfig;
use crate::identity::local_peer_id;
use crate::lifecycle::{AppPhase, UnlimitedBackground};
use crate::mesh::MeshNode;
use crate::peer::PeerId;
use crate::protocol::NowPlaying;
use crate::registry::MeshSnapshot;
use crate::transport::LanTransport;

const MAX_LINE: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "nearcast")]
#[command(about = "Share what you're playing with nearby devices", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the mesh and read commands from stdin
    Run(RunArgs),

    /// Print the effective configuration as JSON
    Config {
        /// Configuration file to merge over the defaults
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Display name advertised to peers (defaults to the hostname)
    #[arg(short, long)]
    pub name: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// UDP port for QUIC sessions (0 picks a free one)
    #[arg(short, long, default_value_t = 0)]
    pub port: u16,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Append a random suffix to the name, for several instances on one host
    #[arg(long)]
    pub simulated: bool,

    /// Peer reachable without mDNS, as NAME@HOST:PORT (repeatable)
    #[arg(long = "peer", value_parser = parse_manual_peer)]
    pub peers: Vec<(PeerId, SocketAddr)>,
}

/// Commands typed at the prompt while a node is running
#[derive(Parser, Debug)]
#[command(name = "nearcast", no_binary_name = true, disable_help_subcommand = true, infer_subcommands = true)]
pub struct ReplCli {
    #[command(subcommand)]
    pub command: ReplCommand,
}

#[derive(Subcommand, Debug)]
pub enum ReplCommand {
    /// Share a track with nearby peers
    Play {
        id: String,
        title: String,
        artist: String,
        album: Option<String>,
    },
    /// Clear the local track
    Stop,
    /// Simulate the app moving to the background
    #[command(alias = "background")]
    Bg,
    /// Simulate the app returning to the foreground
    #[command(alias = "foreground")]
    Fg,
    /// Print the peer table
    Peers,
    /// Show available commands
    Help,
    /// Leave the mesh and exit
    #[command(alias = "exit")]
    Quit,
}

/// Parsed stdin command
#[derive(Debug, Clone, PartialEq)]
pub enum InputCommand {
    Play(NowPlaying),
    Stop,
    Phase(AppPhase),
    Peers,
    Help,
    Quit,
}

impl From<ReplCommand> for InputCommand {
    fn from(command: ReplCommand) -> Self {
        match command {
            ReplCommand::Play { id, title, artist, album } => {
                let track = NowPlaying::new(id, title, artist);
                InputCommand::Play(match album {
                    Some(album) => track.with_album(album),
                    None => track,
                })
            }
            ReplCommand::Stop => InputCommand::Stop,
            ReplCommand::Bg => InputCommand::Phase(AppPhase::Background),
            ReplCommand::Fg => InputCommand::Phase(AppPhase::Foreground),
            ReplCommand::Peers => InputCommand::Peers,
            ReplCommand::Help => InputCommand::Help,
            ReplCommand::Quit => InputCommand::Quit,
        }
    }
}

pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Config { config } => {
            let config = load_config(config.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<MeshConfig> {
    match path {
        Some(path) => MeshConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(MeshConfig::default()),
    }
}

async fn run_node(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if args.simulated {
        config.simulated_host = true;
    }

    let local_id = local_peer_id(args.name.as_deref(), config.simulated_host);
    let transport = LanTransport::bind(local_id, &config, args.port)
        .context("Failed to start the LAN transport")?;
    for (peer, addr) in args.peers {
        transport.add_known_address(peer, addr);
    }
    let port = transport.port();

    let node = MeshNode::spawn(transport, config.clone(), Arc::new(UnlimitedBackground))
        .context("Failed to start the mesh")?;
    println!("Joined as \"{}\" on port {}. Type `help` for commands.", node.local_id(), port);

    let refresh = tokio::spawn(render_loop(node.subscribe(), config.heartbeat_interval()));
    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new_with_max_length(MAX_LINE));

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => match parse_line(&line) {
                    Ok(Some(InputCommand::Quit)) => break,
                    Ok(Some(command)) => apply(&node, command)?,
                    Ok(None) => {}
                    Err(message) => println!("{}", message),
                },
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Failed to read stdin");
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    refresh.abort();
    node.shutdown().await.context("Mesh did not shut down cleanly")?;
    Ok(())
}

fn apply(node: &MeshNode, command: InputCommand) -> Result<()> {
    match command {
        InputCommand::Play(track) => {
            println!("Now playing: {} by {}", track.title, track.artist);
            node.set_now_playing(Some(track))?;
        }
        InputCommand::Stop => node.set_now_playing(None)?,
        InputCommand::Phase(phase) => node.set_app_phase(phase)?,
        InputCommand::Peers => print!("{}", format_peers(&node.snapshot())),
        InputCommand::Help => print!("{}", help_text()),
        InputCommand::Quit => {}
    }
    Ok(())
}

/// Re-render the peer table once per interval, when it changed
async fn render_loop(snapshots: watch::Receiver<Arc<MeshSnapshot>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    let mut last = String::new();
    loop {
        ticker.tick().await;
        let table = format_peers(&snapshots.borrow());
        if table != last {
            print!("{}", table);
            last = table;
        }
    }
}

pub fn format_peers(snapshot: &MeshSnapshot) -> String {
    if snapshot.peers.is_empty() {
        return "No peers nearby\n".to_string();
    }
    let mut out = String::new();
    for (id, view) in &snapshot.peers {
        let playing = match &view.last_known_state {
            Some(track) => format!("{} by {}", track.title, track.artist),
            None => "-".to_string(),
        };
        let mut line = format!("  {:<24} {:<14} {}", id.as_str(), view.connection_state.to_string(), playing);
        if view.reconnection_attempts > 0 {
            line.push_str(&format!("  (reconnect {})", view.reconnection_attempts));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Parse one stdin line. Blank lines give `Ok(None)`.
pub fn parse_line(line: &str) -> std::result::Result<Option<InputCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let args = shlex::split(line).ok_or_else(|| "Error: mismatched quotes".to_string())?;
    let cli = ReplCli::try_parse_from(args).map_err(|e| e.to_string())?;
    Ok(Some(cli.command.into()))
}

/// One line per prompt command, from the clap definitions
pub fn help_text() -> String {
    let mut out = String::from("Available commands:\n");
    for sub in ReplCli::command().get_subcommands() {
        let usage = sub
            .get_positionals()
            .map(|arg| {
                let name = arg.get_id().as_str();
                if arg.is_required_set() {
                    format!(" <{}>", name)
                } else {
                    format!(" [{}]", name)
                }
            })
            .collect::<String>();
        let about = sub.get_about().map(|a| a.to_string()).unwrap_or_default();
        out.push_str(&format!("  {:<36} {}\n", format!("{}{}", sub.get_name(), usage), about));
    }
    out
}

fn parse_manual_peer(s: &str) -> std::result::Result<(PeerId, SocketAddr), String> {
    let (name, addr) = s
        .rsplit_once('@')
        .ok_or_else(|| format!("expected NAME@HOST:PORT, got '{}'", s))?;
    if name.is_empty() {
        return Err("peer name must not be empty".to_string());
    }
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
    Ok((PeerId::from(name), addr))
}
