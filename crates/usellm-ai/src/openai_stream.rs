//! Re-stream an OpenAI chat completion as plain content fragments.
//!
//! The SSE framing is parsed away and only `choices[0].delta.content` is
//! passed on, so a server can relay the fragments as a plain-text body that
//! clients read with [`WireFormat::RawText`](crate::accumulator::WireFormat).

use std::collections::VecDeque;
use std::fmt::Display;

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};

use usellm_core::sse::{ParseEvent, SseParser};
use usellm_core::utf8_stream::Utf8ChunkDecoder;

use crate::accumulator::{DONE_SENTINEL, extract_delta_content};
use crate::error::StreamError;

struct DeltaState<S> {
    source: S,
    parser: SseParser,
    decoder: Utf8ChunkDecoder,
    queue: VecDeque<Result<String, StreamError>>,
    done: bool,
}

impl<S> DeltaState<S> {
    /// Parse `text` and queue the resulting fragments. Stops at the sentinel
    /// or the first bad chunk; nothing after either is read.
    fn feed(&mut self, text: &str) {
        let mut records = Vec::new();
        self.parser.feed_with(text, |record| records.push(record));

        for record in records {
            let ParseEvent::Event(event) = record else {
                continue;
            };
            if event.data == DONE_SENTINEL {
                tracing::trace!("Content stream reached {DONE_SENTINEL}");
                self.done = true;
                return;
            }
            match extract_delta_content(&event.data) {
                Ok(fragment) if fragment.is_empty() => {}
                Ok(fragment) => self.queue.push_back(Ok(fragment)),
                Err(e) => {
                    self.queue.push_back(Err(e));
                    self.done = true;
                    return;
                }
            }
        }
    }
}

/// Lazily turn an SSE chat completion body into its content fragments.
///
/// Empty fragments are skipped. An error is yielded once and ends the stream.
pub fn content_deltas<S, B, E>(source: S) -> impl Stream<Item = Result<String, StreamError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = DeltaState {
        source,
        parser: SseParser::new(),
        decoder: Utf8ChunkDecoder::new(),
        queue: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.source.next().await {
                Some(Ok(chunk)) => {
                    let text = state.decoder.decode(chunk.as_ref());
                    state.feed(&text);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(StreamError::Transport(e.to_string())), state));
                }
                None => {
                    let tail = state.decoder.finish();
                    state.feed(&tail);
                    state.done = true;
                }
            }
        }
    })
}

/// [`content_deltas`] encoded as body bytes for a plain-text response.
pub fn into_text_body<S, B, E>(source: S) -> impl Stream<Item = Result<Bytes, StreamError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    content_deltas(source).map(|item| item.map(Bytes::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{WireFormat, accumulate};
    use std::convert::Infallible;

    const BODY: &str = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
        data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
        data: {\"choices\":[{\"delta\":{\"content\":\"lo ✓\"}}]}\n\n\
        data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
        data: [DONE]\n\n";

    fn byte_source(body: &str, size: usize) -> impl Stream<Item = Result<Vec<u8>, Infallible>> + Unpin {
        let parts: Vec<Vec<u8>> = body.as_bytes().chunks(size).map(|c| c.to_vec()).collect();
        stream::iter(parts.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_content_deltas() {
        let deltas: Vec<String> = content_deltas(byte_source(BODY, 5))
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(deltas, vec!["Hel", "lo ✓"]);
    }

    #[tokio::test]
    async fn test_nothing_after_sentinel() {
        let body = format!("{BODY}data: {{\"choices\":[{{\"delta\":{{\"content\":\"late\"}}}}]}}\n\n");
        let deltas: Vec<String> = content_deltas(byte_source(&body, body.len()))
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(deltas, vec!["Hel", "lo ✓"]);
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: oops\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n";
        let items: Vec<_> = content_deltas(byte_source(body, body.len())).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "a");
        assert!(matches!(items[1], Err(StreamError::Json(_))));
    }

    #[tokio::test]
    async fn test_text_body_matches_event_stream_result() {
        let relayed = into_text_body(byte_source(BODY, 3)).boxed();
        let via_text = accumulate(WireFormat::RawText, relayed, None).await.unwrap();
        let direct = accumulate(WireFormat::EventStream, byte_source(BODY, 3), None)
            .await
            .unwrap();
        assert_eq!(via_text.message, direct.message);
        assert_eq!(direct.message.content, "Hello ✓");
    }
}
