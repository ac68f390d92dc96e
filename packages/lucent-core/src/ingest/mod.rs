//! The per-channel publishing pipeline and fan-out engine.

pub mod grabber;
pub mod manager;
pub mod opus;
pub mod publish;

pub use grabber::{GrabError, ThumbEvent, ThumbnailSink};
pub use manager::{Channel, ChannelInfo, Liveness, Manager, ViewerGuard};
pub use opus::ConvertError;
pub use publish::IngestError;
