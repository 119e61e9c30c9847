//! Producer stream plumbing
//!
//! - `line_reader`: newline framing over any non-blocking reader
//! - `pipe`: non-blocking, closable child stdout read ends
//! - `channel`: worker-thread-fed source for blocking producers

pub mod channel;
pub mod line_reader;
pub mod pipe;

pub use channel::{channel, ChannelSink, ChannelSource};
pub use line_reader::{FramedLineReader, PolledLines, ReaderState};
pub use pipe::{set_nonblocking, PipeEnd, PipeSource};
