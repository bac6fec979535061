//! Portgate server core
//!
//! A central gateway that multiplexes persistent outbound client sessions,
//! exposes on-demand TCP tunnels into client-side services, and fans out
//! command/script jobs across one or many clients. The HTTP API surface,
//! login flow and client-side executor are external collaborators; this
//! crate provides the operations they call into.

pub mod banlist;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod listener;
pub mod ports;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod tunnel;

pub use banlist::{BanList, MaxBadAttemptsBanList};
pub use client::{Client, ClientView, ConnectionState, StartTunnelOptions};
pub use config::{ConfigError, ServerConfig};
pub use dispatcher::{Dispatcher, ExecuteInput, MultiDispatchRequest};
pub use error::{ErrorKind, ServerError};
pub use identity::Identity;
pub use listener::ClientListener;
pub use ports::{PortDistributor, PortError};
pub use registry::{ClientListOptions, ClientRegistry, ClientSortField, User};
pub use server::Server;
pub use session::{Session, SessionError, SessionEvent};
pub use tunnel::{Tunnel, TunnelInfo};
