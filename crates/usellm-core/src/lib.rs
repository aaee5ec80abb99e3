pub mod sse;
pub mod types;
pub mod utf8_stream;

pub use sse::{ParseEvent, ParsedEvent, ReconnectInterval, SseParser};
pub use types::{ChatMessage, ChatResult, ChatStreamUpdate, Role, StreamEnd};
pub use utf8_stream::Utf8ChunkDecoder;
