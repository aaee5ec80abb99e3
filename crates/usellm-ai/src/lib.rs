pub mod accumulator;
pub mod client;
pub mod env_keys;
pub mod error;
pub mod openai_stream;

pub use accumulator::{
    Applied, DONE_SENTINEL, DeltaAccumulator, UpdateCallback, WireFormat, accumulate,
    accumulate_chat_stream, accumulate_raw_text_stream, extract_delta_content,
};
pub use client::{ChatClient, ClientConfig, DEFAULT_BASE_URL};
pub use error::StreamError;
pub use openai_stream::{content_deltas, into_text_body};
