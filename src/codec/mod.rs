//! Frame encoding and the per-connection reader and writer

pub mod framing;
pub mod reader;
pub mod writer;

pub use framing::{ByteOrder, Framing, HeaderWidth};
pub use reader::{PacketReader, ReaderState};
pub use writer::PacketWriter;
