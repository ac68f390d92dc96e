//! FTL ingest: text-protocol handshake over TCP with an RTP media flow over
//! a shared UDP socket.
//!
//! A publisher connects, authenticates with an HMAC challenge-response,
//! negotiates codecs and SSRCs, and then streams RTP to the advertised UDP
//! port. The [`rtp::RtpDispatcher`] demultiplexes datagrams to sessions by
//! (source IP, SSRC); [`deframe`] reassembles elementary-stream packets out
//! of the RTP payloads.

pub mod auth;
pub mod deframe;
pub mod rtp;
pub mod session;

pub use auth::{AuthError, ChannelAuth, IngestAuth};
pub use rtp::{RtpDispatcher, RtpSource};
pub use session::{FtlError, FtlServer, PublishSink};
