//! `reliable-udp` — ordered, reliable block delivery over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   DATA blocks    ┌──────────────────────┐
//!  │    Sender    │─────────────────▶│  Server (receiver)   │
//!  │  SendWindow  │                  │  LossSimulator       │
//!  │  AckReceiver │◀─────────────────│  ReceiveTracker      │
//!  └──────┬───────┘  cumulative ACKs └──────────┬───────────┘
//!         │                                     │
//!  ┌──────▼─────────────────────────────────────▼──────┐
//!  │  Connection (SYN / FIN state machine per peer)    │
//!  └──────┬────────────────────────────────────────────┘
//!         │ 20-byte header + payload datagrams
//!  ┌──────▼────┐
//!  │  Socket   │  (thin async wrapper around tokio UdpSocket)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]       — wire format (encode / decode)
//! - [`block`]        — splitting a payload into numbered blocks
//! - [`config`]       — sender and receiver parameters
//! - [`connection`]   — handshake/teardown transitions and the error type
//! - [`state`]        — roles and phases
//! - [`timer`]        — mean-RTT retransmission timeout
//! - [`window`]       — Go-Back-N send window
//! - [`ack_receiver`] — dedicated ACK listener task
//! - [`sender`]       — sender session (handshake, transfer, teardown)
//! - [`tracker`]      — Go-Back-N receive-side state
//! - [`simulator`]    — receiver-side loss injection
//! - [`receiver`]     — receiving server
//! - [`stats`]        — RTT statistics and session report
//! - [`socket`]       — async UDP socket abstraction

pub mod ack_receiver;
pub mod block;
pub mod config;
pub mod connection;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;
pub mod timer;
pub mod tracker;
pub mod window;

pub use config::{AckMode, ReceiverConfig, SchedulingModel, SenderConfig, TimeoutConfig};
pub use connection::ConnError;
pub use receiver::{ReceiverReport, Server};
pub use sender::Sender;
pub use stats::SessionReport;
