#![warn(missing_docs)]

//! relaynet transport subsystem: peers, routes, gateway health checking, credited buffers, RPC and bulk
//!
//! Everything hangs off an [`Lnet`] context built over one
//! [`NetworkInterface`] driver per local net. Drivers report completions
//! as [`NetEvent`]s that the context dispatches to whatever owns the
//! binding. [`sim::SimFabric`] is an in-process driver for tests.

pub mod buffer;
pub mod bulk;
pub mod config;
pub mod error;
pub mod event;
pub mod lnet;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod ni;
pub mod nid;
pub mod peer;
pub mod ping;
pub mod route;
pub mod router_checker;
pub mod sim;

pub use buffer::{BufferPool, Credit, PeerCredit, PeerCredits, PoolStats, RouterBuffer, RouterPools};
pub use bulk::{BulkChannel, BulkCompletion, BulkDescriptor, BulkRole};
pub use config::{Forwarding, LnetConfig, RouterConfig, RpcConfig};
pub use error::{TransportError, TransportResult};
pub use event::EventTag;
pub use lnet::Lnet;
pub use logging::{init_logging, try_init_logging, LogFormat};
pub use message::{
    IncomingRequest, MessageTransport, Reply, ReplyHandle, Request, RequestFlags, Service, ServiceConfig,
};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use ni::{
    AckRequest, EventError, EventKind, MdHandle, MdOptions, MemoryDescriptor, NetEvent, NetworkInterface,
    NiTunables, Region, SendTarget, Threshold,
};
pub use nid::{NetId, NetKind, Nid, ProcessId, SERVER_PID};
pub use peer::{Peer, PeerRegistry, PeerStats};
pub use ping::{NiStatus, PingInfo, PingVersion};
pub use route::{Route, RouteInfo, RouteTable};
pub use router_checker::{CheckerState, GatewayState, RouterChecker};
