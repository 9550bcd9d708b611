pub mod config;
pub mod network;
pub mod raft;

// Public exports
pub use config::{Config, ConfigError};
pub use network::{GateOptions, LeaderGate, LocalTransport, TcpTransport, Transport};
pub use raft::{ClusterStatus, NodeRole, Raft, RaftConfig, RaftError};
