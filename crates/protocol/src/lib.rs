pub mod address;
pub mod codec;
pub mod error;
pub mod media_path;
pub mod serial;

pub use address::Address;
pub use codec::{HeaderCodec, LengthCodec};
pub use error::{CloseReason, Kind};
pub use media_path::MediaPath;
pub use serial::{Generation, Serial, ThreadId};
