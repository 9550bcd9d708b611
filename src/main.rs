use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lodestar::config::{parse_peers, Config};
use lodestar::network::{run_http_admin, AdminState, RaftServer, ServerInfo, TcpTransport};
use lodestar::raft::Raft;

struct RotatingFile {
    path: String,
    max_size: u64,
    max_files: u32,
    file: File,
    current_size: u64,
}

impl RotatingFile {
    fn new(path: String, max_size: u64, max_files: u32) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files,
            file,
            current_size,
        })
    }

    // path -> path.1 -> path.2 ... up to max_files
    fn rotate(&mut self) -> io::Result<()> {
        for i in (1..self.max_files).rev() {
            let _ = std::fs::rename(
                format!("{}.{}", self.path, i),
                format!("{}.{}", self.path, i + 1),
            );
        }
        let _ = std::fs::rename(&self.path, format!("{}.1", self.path));

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.current_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn init_logging() {
    let file_logger = std::env::var("LODESTAR_LOG_FILE").ok().and_then(|path| {
        let max_size_mb: u64 = env_number("LODESTAR_LOG_MAX_SIZE_MB", 10);
        let max_files: u32 = env_number("LODESTAR_LOG_MAX_FILES", 3);
        RotatingFile::new(path, max_size_mb * 1024 * 1024, max_files).ok()
    });

    // Only one `log` backend can be installed: plain file output when a log
    // file is configured, otherwise `log` records are bridged into tracing.
    match file_logger {
        Some(rot) => {
            let _ = env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or("info"),
            )
            .target(env_logger::Target::Pipe(Box::new(rot)))
            .try_init();
        }
        None => {
            let _ = LogTracer::init();
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

fn http_get(host_port: &str, path: &str) -> Result<String> {
    use std::io::Read;
    use std::net::TcpStream;

    let mut stream = TcpStream::connect(host_port)
        .with_context(|| format!("failed to connect to {host_port}"))?;
    let req = format!("GET {path} HTTP/1.1\r\nHost: {host_port}\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes())?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    let resp = String::from_utf8_lossy(&buf);
    match resp.find("\r\n\r\n") {
        Some(pos) => Ok(resp[pos + 4..].to_string()),
        None => Ok(resp.to_string()),
    }
}

#[derive(Parser)]
#[command(name = "lodestar")]
#[command(about = "Leader election and leader-gated routing for a small cluster")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a cluster member
    Node(NodeArgs),

    /// Query a running node's HTTP surface
    Admin {
        #[command(subcommand)]
        cmd: AdminCmd,
    },
}

#[derive(Args)]
struct NodeArgs {
    /// Unique ID for this node
    #[arg(short, long)]
    id: Option<String>,

    /// Address of the election RPC listener
    #[arg(short, long)]
    address: Option<String>,

    /// Address of the HTTP surface
    #[arg(long)]
    http: Option<String>,

    /// Comma-separated peers (id=host:port); an entry for this node is ignored
    #[arg(short, long)]
    peers: Option<String>,

    /// Comma-separated peer HTTP addresses (id=host:port) used for redirects
    #[arg(long)]
    peer_http: Option<String>,

    /// JSON config file, applied before environment and flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    election_timeout_min_ms: Option<u64>,

    #[arg(long)]
    election_timeout_max_ms: Option<u64>,

    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    #[arg(long)]
    region: Option<String>,
}

#[derive(Subcommand)]
enum AdminCmd {
    /// Show node health (host:port of the HTTP surface)
    Status {
        #[arg(long)]
        http: String,
    },
    /// Show this node's view of the cluster
    Cluster {
        #[arg(long)]
        http: String,
    },
    /// Dump Prometheus metrics
    Metrics {
        #[arg(long)]
        http: String,
    },
}

impl NodeArgs {
    fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        cfg.apply_env()?;

        if let Some(id) = self.id {
            cfg.node_id = id;
        }
        if let Some(address) = self.address {
            cfg.raft_address = address;
        }
        if let Some(http) = self.http {
            cfg.http_address = http;
        }
        if let Some(region) = self.region {
            cfg.region = region;
        }
        if let Some(peers) = self.peers {
            cfg.peers = parse_peers(&peers)?;
        }
        if let Some(peer_http) = self.peer_http {
            cfg.apply_peer_http(&peer_http)?;
        }
        if let Some(min) = self.election_timeout_min_ms {
            cfg.election_timeout_min_ms = min;
        }
        if let Some(max) = self.election_timeout_max_ms {
            cfg.election_timeout_max_ms = max;
        }
        if let Some(hb) = self.heartbeat_interval_ms {
            cfg.heartbeat_interval_ms = hb;
        }
        Ok(cfg)
    }
}

async fn run_node(cfg: Config) -> Result<()> {
    let raft_config = cfg.to_raft_config()?;
    let raft_addr: SocketAddr = cfg
        .raft_address
        .parse()
        .with_context(|| format!("invalid election address {}", cfg.raft_address))?;
    let http_addr: SocketAddr = cfg
        .http_address
        .parse()
        .with_context(|| format!("invalid HTTP address {}", cfg.http_address))?;

    info!(
        "Starting node {} (region {}) with {} peer(s)",
        cfg.node_id,
        cfg.region,
        raft_config.peers.len()
    );
    for peer in raft_config.peers.values() {
        info!("Peer {} at {}", peer.id, peer.address);
    }

    let transport = Arc::new(TcpTransport::new(&raft_config.peers));
    let raft = Raft::new(raft_config, transport)?;
    raft.start().await?;
    raft.spawn_status_logger(cfg.status_log_interval()).await;

    let admin = AdminState::new(
        Arc::clone(&raft.node),
        raft.handle(),
        ServerInfo {
            id: cfg.node_id.clone(),
            region: cfg.region.clone(),
            raft_address: cfg.raft_address.clone(),
            http_address: cfg.http_address.clone(),
        },
    )
    .with_gate_enabled(cfg.leader_election_enabled);

    let rpc = RaftServer::new(raft.handle());

    let outcome: Result<()> = tokio::select! {
        res = rpc.serve(raft_addr) => res.context("election RPC listener failed"),
        res = run_http_admin(http_addr, admin) => res.context("HTTP admin server failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            Ok(())
        }
    };

    raft.shutdown().await;
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Node(args) => run_node(args.into_config()?).await?,
        Command::Admin { cmd } => {
            let (http, path) = match &cmd {
                AdminCmd::Status { http } => (http, "/health"),
                AdminCmd::Cluster { http } => (http, "/cluster"),
                AdminCmd::Metrics { http } => (http, "/metrics"),
            };
            println!("{}", http_get(http, path)?);
        }
    }

    Ok(())
}
