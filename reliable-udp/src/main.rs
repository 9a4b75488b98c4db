//! Entry point for `reliable-udp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All actual protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;

use reliable_udp::socket::Socket;
use reliable_udp::{
    AckMode, ReceiverConfig, SchedulingModel, Sender, SenderConfig, Server, TimeoutConfig,
};

/// Reliable, ordered block delivery over UDP.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Log every packet (equivalent to RUST_LOG=debug).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Receive blocks from any number of senders until Ctrl-C.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Probability that an inbound DATA datagram is dropped.
        #[arg(long, default_value_t = 0.2)]
        drop_rate: f64,
        /// Seed for the loss simulator.
        #[arg(long)]
        seed: Option<u64>,
        /// Delay between ACK+FIN and the trailing FIN.
        #[arg(long, default_value_t = 500)]
        grace_ms: u64,
        /// Abandon a peer that sends nothing for this long.
        #[arg(long, default_value_t = 30_000)]
        idle_timeout_ms: u64,
        #[arg(long, value_enum, default_value_t = AckModeArg::ByteOffset)]
        ack_mode: AckModeArg,
    },
    /// Deliver one payload to a server and print the session summary.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Number of random blocks to send.
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        packets: Option<usize>,
        /// Send the contents of this file instead.
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value_t = 40)]
        min_len: usize,
        #[arg(long, default_value_t = 80)]
        max_len: usize,
        /// Go-Back-N window size.
        #[arg(long, default_value_t = 5)]
        window: usize,
        /// Payload bytes allowed per round.
        #[arg(long, default_value_t = 400)]
        budget: usize,
        #[arg(long, value_enum, default_value_t = ModelArg::Dedicated)]
        model: ModelArg,
        /// Retransmission timeout before any RTT sample exists.
        #[arg(long, default_value_t = 300)]
        default_timeout_ms: u64,
        /// Floor applied to the adaptive timeout.
        #[arg(long, default_value_t = 50)]
        min_timeout_ms: u64,
        /// Timeout = multiplier × mean RTT.
        #[arg(long, default_value_t = 5.0)]
        multiplier: f64,
        /// Give up on a block after this many transmissions.
        #[arg(long, default_value_t = 50)]
        max_transmissions: u32,
        /// Seed for block lengths and payload bytes.
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, value_enum, default_value_t = AckModeArg::ByteOffset)]
        ack_mode: AckModeArg,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AckModeArg {
    ByteOffset,
    BlockIndex,
}

impl From<AckModeArg> for AckMode {
    fn from(arg: AckModeArg) -> Self {
        match arg {
            AckModeArg::ByteOffset => AckMode::ByteOffset,
            AckModeArg::BlockIndex => AckMode::BlockIndex,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModelArg {
    Dedicated,
    Poll,
}

impl From<ModelArg> for SchedulingModel {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Dedicated => SchedulingModel::DedicatedReceiver,
            ModelArg::Poll => SchedulingModel::Poll,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG still wins over the default level.
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.mode {
        Mode::Server {
            bind,
            drop_rate,
            seed,
            grace_ms,
            idle_timeout_ms,
            ack_mode,
        } => {
            let config = ReceiverConfig {
                drop_probability: drop_rate,
                seed,
                fin_grace: Duration::from_millis(grace_ms),
                idle_timeout: Duration::from_millis(idle_timeout_ms),
                ack_mode: ack_mode.into(),
            };
            run_server(bind, config).await
        }
        Mode::Client {
            server,
            packets,
            file,
            min_len,
            max_len,
            window,
            budget,
            model,
            default_timeout_ms,
            min_timeout_ms,
            multiplier,
            max_transmissions,
            seed,
            ack_mode,
        } => {
            let config = SenderConfig {
                window_size: window,
                round_budget_bytes: budget,
                block_len: min_len..=max_len,
                timeout: TimeoutConfig {
                    default_timeout: Duration::from_millis(default_timeout_ms),
                    min_timeout: Duration::from_millis(min_timeout_ms),
                    multiplier,
                },
                max_transmissions,
                model: model.into(),
                ack_mode: ack_mode.into(),
                seed,
                ..SenderConfig::default()
            };
            let payload = match (packets, file) {
                (_, Some(path)) => Payload::File(
                    tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                (Some(count), None) => Payload::Random(count),
                (None, None) => anyhow::bail!("one of --packets or --file is required"),
            };
            run_client(server, config, payload).await
        }
    }
}

enum Payload {
    Random(usize),
    File(Vec<u8>),
}

async fn run_server(bind: SocketAddr, config: ReceiverConfig) -> anyhow::Result<()> {
    let server = Server::bind(bind, config)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received; shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    let reports = server.run(shutdown_rx).await?;
    for r in &reports {
        println!(
            "{}: {} ({} accepted, {} out of order, {} dropped, {} malformed, {} bytes)",
            r.peer,
            r.phase,
            r.stats.accepted,
            r.stats.out_of_order,
            r.stats.dropped,
            r.stats.malformed,
            r.stats.bytes_accepted
        );
    }
    Ok(())
}

async fn run_client(server: SocketAddr, config: SenderConfig, payload: Payload) -> anyhow::Result<()> {
    let local: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = Socket::bind(local).await?;
    log::info!("Starting client on {}, connecting to {server}", socket.local_addr);

    let mut sender = Sender::connect(socket, server, config)
        .await
        .with_context(|| format!("connecting to {server}"))?;
    let report = match payload {
        Payload::Random(count) => sender.transfer_random(count).await?,
        Payload::File(data) => sender.transfer_bytes(&data).await?,
    };
    println!("{report}");
    Ok(())
}
