//! Framed bidirectional transport over the device's serial endpoint.

pub mod codec;
pub mod transport;
pub mod writer;

pub use codec::{FrameDecoder, LinkItem};
pub use transport::{open_serial, spawn_reader, LinkEvent, LinkTransport, ReaderHandle};
pub use writer::CommandWriter;
