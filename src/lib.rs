//! Nearby "now playing" mesh.
//!
//! Devices on the same local network discover each other, keep sessions alive
//! with heartbeats, reconnect with bounded retries and share what each of them
//! is currently playing. [`MeshNode`] is the entry point; it runs over any
//! [`Transport`], with [`LanTransport`] (mDNS + QUIC) for real networks and
//! [`SimNetwork`] for in-process use.

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod liveness;
pub mod logging;
pub mod mesh;
pub mod peer;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod state;
pub mod transport;

pub use config::MeshConfig;
pub use error::{MeshError, MeshResult, TransportError};
pub use lifecycle::{AllowanceId, AppPhase, BackgroundHost, ExpiryNotifier, UnlimitedBackground};
pub use mesh::MeshNode;
pub use peer::{ConnectionState, PeerId, PeerView};
pub use protocol::{Heartbeat, NowPlaying, WireMessage};
pub use registry::MeshSnapshot;
pub use transport::{LanTransport, SimNetwork, SimStats, SimTransport, Transport, TransportEvent};

use clap::Parser;

/// Binary entry point: parse arguments, set up logging, run the command.
pub fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let log_dir = match &cli.command {
        cli::Commands::Run(args) => args.log_dir.clone(),
        cli::Commands::Config { .. } => None,
    };
    let _guard = logging::init(cli.verbose, log_dir.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(cli::execute(cli))
}
