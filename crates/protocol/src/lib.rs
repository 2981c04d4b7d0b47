//! Wire protocol for the Parley chat relay.
//!
//! JSON envelopes over length-prefixed TCP frames. [`Envelope`] mirrors
//! the wire object field for field; [`frame`] is the resumable codec both
//! ends of the connection share.

pub mod constants;
pub mod envelope;
pub mod frame;

// Re-export the types both ends of the wire need.
pub use constants::{Action, DEFAULT_MAX_FRAME, DEFAULT_PORT, MAX_NAME_LEN};
pub use envelope::Envelope;
pub use frame::{FrameDecoder, FrameError, FramedReader, encode_frame, write_frame};
