//! Portgate Protocol Definitions
//!
//! This crate defines the framing, control messages and shared models for the
//! portgate client/server session layer, plus the IPv4 tunnel ACLs evaluated
//! at tunnel-accept time.

pub mod acl;
pub mod codec;
pub mod messages;
pub mod models;

pub use acl::{AclError, TunnelAcl};
pub use codec::{read_message, write_message, CodecError, Frame, FrameFlags, FrameType, StreamId};
pub use messages::*;
pub use models::*;

/// Protocol version, bumped on every incompatible wire change
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved stream ID for control messages
pub const CONTROL_STREAM_ID: u32 = 0;
