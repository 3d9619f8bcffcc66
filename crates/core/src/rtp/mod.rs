//! RTP parameters & mapping (spec §4.10), and the Producer/Consumer model
//! built on top of them (spec §4.11).

pub mod consumer;
pub mod parameters;
pub mod producer;

pub use consumer::Consumer;
pub use parameters::{Codec, Encoding, HeaderExtension, RtpParameters};
pub use producer::Producer;
