//! Connection and media core: event loop primitives, the ICE/DTLS/SCTP
//! connection stack, SDP negotiation, RTP routing, and the labeled stream
//! multiplexer. A `qrpc-server` binary links this crate against real
//! sockets; embedders can link it directly to get a WHIP-speaking WebRTC
//! server without writing their own I/O loop.

pub mod alarm;
pub mod config;
pub mod connection;
pub mod dns;
pub mod dtls;
pub mod handler_map;
pub mod handshake;
pub mod http;
pub mod ice;
pub mod router;
pub mod rtp;
pub mod sctp;
pub mod sdp;
pub mod session;
pub mod slab;
pub mod stream;
pub mod worker;

pub use qrpc_protocol::{Address, CloseReason, Generation, HeaderCodec, Kind, LengthCodec, MediaPath, Serial, ThreadId};

pub type Result<T> = std::result::Result<T, qrpc_protocol::error::QrpcError>;
