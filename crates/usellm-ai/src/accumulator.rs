//! Folds a streaming chat completion into one growing assistant message.

use std::fmt::Display;

use futures::{Stream, StreamExt};
use serde::Deserialize;

use usellm_core::sse::{ParseEvent, ParsedEvent, SseParser};
use usellm_core::types::{ChatMessage, ChatResult, ChatStreamUpdate, StreamEnd};
use usellm_core::utf8_stream::Utf8ChunkDecoder;

use crate::error::StreamError;

/// Data payload that marks the normal end of a chat completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Per-increment observer. Receives the full text so far.
pub type UpdateCallback<'a> = &'a mut (dyn FnMut(&ChatStreamUpdate) + Send);

/// Wire contract of a streaming response body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// `text/event-stream` chat completion chunks ending in `[DONE]`.
    #[default]
    EventStream,
    /// Plain text: the body is the message content itself.
    RawText,
}

// ---------- Chunk shape ----------

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: Option<String>,
}

/// Extract `choices[0].delta.content` from one chunk payload. A delta without
/// content (role-only or finish chunks) yields an empty fragment.
pub fn extract_delta_content(data: &str) -> Result<String, StreamError> {
    let chunk: CompletionChunk = serde_json::from_str(data)?;

    if let Some(err) = chunk.error {
        return Err(StreamError::Provider(
            err.message.unwrap_or_else(|| "Unknown error".to_string()),
        ));
    }

    let delta = chunk
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| StreamError::MalformedChunk("missing choices[0]".to_string()))?
        .delta
        .ok_or_else(|| StreamError::MalformedChunk("missing choices[0].delta".to_string()))?;

    Ok(delta.content.unwrap_or_default())
}

// ---------- DeltaAccumulator ----------

/// Outcome of applying one parsed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Delta(ChatStreamUpdate),
    Done,
}

#[derive(Debug)]
pub struct DeltaAccumulator {
    text: String,
    is_first: bool,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            is_first: true,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Apply one event. The sentinel is recognised whatever the event name.
    pub fn apply(&mut self, event: &ParsedEvent) -> Result<Applied, StreamError> {
        if event.data == DONE_SENTINEL {
            return Ok(Applied::Done);
        }
        let fragment = extract_delta_content(&event.data)?;
        Ok(Applied::Delta(self.push_text(&fragment)))
    }

    /// Append text verbatim, as for a raw (unframed) body.
    pub fn push_text(&mut self, fragment: &str) -> ChatStreamUpdate {
        self.text.push_str(fragment);
        self.snapshot(false)
    }

    /// Terminal update (`is_last == true`) and the final result.
    pub fn finish(mut self, end: StreamEnd) -> (ChatStreamUpdate, ChatResult) {
        let update = self.snapshot(true);
        let result = ChatResult {
            message: ChatMessage::assistant(self.text),
            end,
        };
        (update, result)
    }

    fn snapshot(&mut self, is_last: bool) -> ChatStreamUpdate {
        let update = ChatStreamUpdate {
            message: ChatMessage::assistant(self.text.clone()),
            is_first: self.is_first,
            is_last,
        };
        self.is_first = false;
        update
    }
}

impl Default for DeltaAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------- Drivers ----------

fn notify(observer: &mut Option<UpdateCallback<'_>>, update: &ChatStreamUpdate) {
    if let Some(cb) = observer.as_deref_mut() {
        cb(update);
    }
}

/// Pump an SSE chat completion body to completion.
///
/// Reading stops as soon as `[DONE]` is seen. A body that simply ends is also
/// a normal completion. Any malformed chunk fails the whole call; updates
/// already delivered to `observer` stand.
pub async fn accumulate_chat_stream<S, B, E>(
    mut source: S,
    mut observer: Option<UpdateCallback<'_>>,
) -> Result<ChatResult, StreamError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut parser = SseParser::new();
    let mut decoder = Utf8ChunkDecoder::new();
    let mut acc = DeltaAccumulator::new();
    let mut records = Vec::new();
    let mut end = StreamEnd::SourceClosed;
    let mut exhausted = false;

    'pump: while !exhausted {
        let text = match source.next().await {
            Some(Ok(chunk)) => decoder.decode(chunk.as_ref()),
            Some(Err(e)) => return Err(StreamError::Transport(e.to_string())),
            None => {
                exhausted = true;
                decoder.finish()
            }
        };

        parser.feed_with(&text, |record| records.push(record));

        for record in records.drain(..) {
            match record {
                ParseEvent::ReconnectInterval(interval) => {
                    tracing::debug!("Ignoring SSE reconnect interval: {}", interval.value);
                }
                ParseEvent::Event(event) => match acc.apply(&event)? {
                    Applied::Done => {
                        end = StreamEnd::Sentinel;
                        break 'pump;
                    }
                    Applied::Delta(update) => notify(&mut observer, &update),
                },
            }
        }
    }

    if end == StreamEnd::SourceClosed {
        tracing::debug!("Chat stream closed without {DONE_SENTINEL}");
    }

    let (update, result) = acc.finish(end);
    notify(&mut observer, &update);
    Ok(result)
}

/// Pump a plain-text body: every decoded chunk is appended as-is.
pub async fn accumulate_raw_text_stream<S, B, E>(
    mut source: S,
    mut observer: Option<UpdateCallback<'_>>,
) -> Result<ChatResult, StreamError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut decoder = Utf8ChunkDecoder::new();
    let mut acc = DeltaAccumulator::new();

    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(|e| StreamError::Transport(e.to_string()))?;
        let text = decoder.decode(chunk.as_ref());
        let update = acc.push_text(&text);
        notify(&mut observer, &update);
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        acc.push_text(&tail);
    }

    let (update, result) = acc.finish(StreamEnd::SourceClosed);
    notify(&mut observer, &update);
    Ok(result)
}

pub async fn accumulate<S, B, E>(
    format: WireFormat,
    source: S,
    observer: Option<UpdateCallback<'_>>,
) -> Result<ChatResult, StreamError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    match format {
        WireFormat::EventStream => accumulate_chat_stream(source, observer).await,
        WireFormat::RawText => accumulate_raw_text_stream(source, observer).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::convert::Infallible;

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn source(parts: Vec<String>) -> impl Stream<Item = Result<Vec<u8>, Infallible>> + Unpin {
        stream::iter(parts.into_iter().map(|p| Ok(p.into_bytes())))
    }

    #[test]
    fn test_extract_delta_content() {
        assert_eq!(
            extract_delta_content(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap(),
            "Hi"
        );
        assert_eq!(
            extract_delta_content(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            ""
        );
        assert_eq!(
            extract_delta_content(r#"{"choices":[{"delta":{"content":null},"finish_reason":"stop"}]}"#)
                .unwrap(),
            ""
        );
    }

    #[test]
    fn test_extract_rejects_bad_shapes() {
        assert!(matches!(
            extract_delta_content("not json"),
            Err(StreamError::Json(_))
        ));
        assert!(matches!(
            extract_delta_content(r#"{"choices":[]}"#),
            Err(StreamError::MalformedChunk(_))
        ));
        assert!(matches!(
            extract_delta_content(r#"{"choices":[{"index":0}]}"#),
            Err(StreamError::MalformedChunk(_))
        ));
        match extract_delta_content(r#"{"error":{"message":"rate limited"}}"#) {
            Err(StreamError::Provider(msg)) => assert_eq!(msg, "rate limited"),
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[test]
    fn test_accumulator_first_and_last_flags() {
        let mut acc = DeltaAccumulator::new();
        let event = ParsedEvent {
            id: None,
            event: None,
            data: r#"{"choices":[{"delta":{"content":"a"}}]}"#.to_string(),
        };
        let Applied::Delta(first) = acc.apply(&event).unwrap() else {
            panic!("expected delta");
        };
        let Applied::Delta(second) = acc.apply(&event).unwrap() else {
            panic!("expected delta");
        };
        assert!(first.is_first && !first.is_last);
        assert!(!second.is_first && !second.is_last);
        assert_eq!(second.message.content, "aa");

        let (last, result) = acc.finish(StreamEnd::SourceClosed);
        assert!(!last.is_first && last.is_last);
        assert_eq!(result.message, ChatMessage::assistant("aa"));
    }

    #[test]
    fn test_sentinel_recognised_for_named_events() {
        let mut acc = DeltaAccumulator::new();
        let event = ParsedEvent {
            id: None,
            event: Some("message".to_string()),
            data: DONE_SENTINEL.to_string(),
        };
        assert_eq!(acc.apply(&event).unwrap(), Applied::Done);
    }

    #[tokio::test]
    async fn test_sentinel_stops_reading() {
        let parts = vec![
            chunk("Hi"),
            "data: [DONE]\n\n".to_string(),
            "data: this is not json\n\n".to_string(),
        ];
        let mut pulled = 0;
        let counted = source(parts).inspect(|_| pulled += 1);

        let result = accumulate_chat_stream(counted, None).await.unwrap();
        assert_eq!(result.message, ChatMessage::assistant("Hi"));
        assert_eq!(result.end, StreamEnd::Sentinel);
        assert_eq!(pulled, 2);
    }

    #[tokio::test]
    async fn test_observer_sees_growing_text_in_order() {
        let body = format!("{}{}{}data: [DONE]\n\n", chunk("Hel"), chunk("lo"), chunk(", world"));
        let parts = body
            .as_bytes()
            .chunks(7)
            .map(|c| c.to_vec())
            .collect::<Vec<_>>();
        let byte_source = stream::iter(parts.into_iter().map(Ok::<_, Infallible>));

        let mut updates = Vec::new();
        let mut on_update = |u: &ChatStreamUpdate| updates.push(u.clone());
        let result = accumulate_chat_stream(byte_source, Some(&mut on_update))
            .await
            .unwrap();

        assert_eq!(result.message.content, "Hello, world");
        let contents: Vec<_> = updates.iter().map(|u| u.message.content.as_str()).collect();
        assert_eq!(contents, vec!["Hel", "Hello", "Hello, world", "Hello, world"]);
        let flags: Vec<_> = updates.iter().map(|u| (u.is_first, u.is_last)).collect();
        assert_eq!(
            flags,
            vec![(true, false), (false, false), (false, false), (false, true)]
        );
    }

    #[tokio::test]
    async fn test_source_closed_without_sentinel() {
        let result = accumulate_chat_stream(source(vec![chunk("partial")]), None)
            .await
            .unwrap();
        assert_eq!(result.message.content, "partial");
        assert_eq!(result.end, StreamEnd::SourceClosed);
    }

    #[tokio::test]
    async fn test_multibyte_split_across_chunks() {
        let body = format!("{}data: [DONE]\n\n", chunk("héllo ✓ 😀"));
        let parts: Vec<Vec<u8>> = body.as_bytes().iter().map(|b| vec![*b]).collect();
        let byte_source = stream::iter(parts.into_iter().map(Ok::<_, Infallible>));

        let result = accumulate_chat_stream(byte_source, None).await.unwrap();
        assert_eq!(result.message.content, "héllo ✓ 😀");
    }

    #[tokio::test]
    async fn test_malformed_chunk_fails_after_partial_delivery() {
        let parts = vec![chunk("ok"), "data: {broken\n\n".to_string(), chunk("never")];
        let mut updates = Vec::new();
        let mut on_update = |u: &ChatStreamUpdate| updates.push(u.message.content.clone());

        let err = accumulate_chat_stream(source(parts), Some(&mut on_update))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Json(_)));
        assert_eq!(updates, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let items: Vec<Result<Vec<u8>, String>> = vec![
            Ok(chunk("a").into_bytes()),
            Err("connection reset".to_string()),
        ];
        let err = accumulate_chat_stream(stream::iter(items), None)
            .await
            .unwrap_err();
        match err {
            StreamError::Transport(msg) => assert_eq!(msg, "connection reset"),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_and_comments_do_not_touch_message() {
        let body = format!(": ping\nretry: 1000\n\n{}data: [DONE]\n\n", chunk("x"));
        let result = accumulate_chat_stream(source(vec![body]), None).await.unwrap();
        assert_eq!(result.message.content, "x");
    }

    #[tokio::test]
    async fn test_empty_source_still_notifies_once() {
        let mut updates = Vec::new();
        let mut on_update = |u: &ChatStreamUpdate| updates.push((u.is_first, u.is_last));
        let result = accumulate_chat_stream(source(Vec::new()), Some(&mut on_update))
            .await
            .unwrap();
        assert_eq!(result.message.content, "");
        assert_eq!(updates, vec![(true, true)]);
    }

    #[tokio::test]
    async fn test_raw_text_stream_appends_verbatim() {
        let parts = vec!["Hel".to_string(), "lo".to_string()];
        let mut updates = Vec::new();
        let mut on_update = |u: &ChatStreamUpdate| {
            updates.push((u.message.content.clone(), u.is_first, u.is_last))
        };
        let result = accumulate(WireFormat::RawText, source(parts), Some(&mut on_update))
            .await
            .unwrap();

        assert_eq!(result.message.content, "Hello");
        assert_eq!(
            updates,
            vec![
                ("Hel".to_string(), true, false),
                ("Hello".to_string(), false, false),
                ("Hello".to_string(), false, true),
            ]
        );
    }
}
