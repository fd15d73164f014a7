pub mod buffer;

pub use buffer::{BufferError, BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
