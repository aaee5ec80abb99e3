//! Server-Sent Events (SSE) parser.
//!
//! Incremental parser for `text/event-stream` bodies. Chunks may split lines,
//! fields or `\r\n` pairs anywhere; the unterminated tail is kept together with
//! the scan cursor so the next `feed` resumes where the previous one stopped.
//!
//! See <https://html.spec.whatwg.org/multipage/server-sent-events.html>.

/// UTF-8 byte order mark read as three Latin-1 code points.
const LATIN1_BOM: [char; 3] = ['\u{EF}', '\u{BB}', '\u{BF}'];

/// A complete event, dispatched on a blank line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    /// Last `id` seen for this event, if any.
    pub id: Option<String>,
    /// Event name. `None` when the server did not send one (browsers would
    /// report `message` here).
    pub event: Option<String>,
    pub data: String,
}

/// Reconnection hint sent through the `retry` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectInterval {
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    Event(ParsedEvent),
    ReconnectInterval(ReconnectInterval),
}

impl ParseEvent {
    pub fn as_event(&self) -> Option<&ParsedEvent> {
        match self {
            ParseEvent::Event(e) => Some(e),
            ParseEvent::ReconnectInterval(_) => None,
        }
    }
}

pub struct SseParser {
    buffer: String,
    is_first_chunk: bool,
    /// Bytes of the buffered partial line already scanned.
    starting_position: usize,
    /// Colon offset found in the buffered partial line.
    starting_field_length: Option<usize>,
    /// Previous line ended in `\r`; a leading `\n` belongs to it.
    discard_trailing_newline: bool,

    event_id: Option<String>,
    event_name: Option<String>,
    data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            is_first_chunk: true,
            starting_position: 0,
            starting_field_length: None,
            discard_trailing_newline: false,
            event_id: None,
            event_name: None,
            data: String::new(),
        }
    }

    /// Clear all state. Required before reusing the parser for a new
    /// connection, e.g. after a reconnect.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed a chunk and collect the records it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParseEvent> {
        let mut records = Vec::new();
        self.feed_with(chunk, |record| records.push(record));
        records
    }

    /// Feed a chunk, calling `on_parse` once per completed record in stream
    /// order. Incomplete input is buffered until the next call.
    pub fn feed_with<F>(&mut self, chunk: &str, mut on_parse: F)
    where
        F: FnMut(ParseEvent),
    {
        self.buffer.push_str(chunk);

        if self.is_first_chunk && !self.buffer.is_empty() {
            strip_bom(&mut self.buffer);
            self.is_first_chunk = false;
        }

        let mut buffer = std::mem::take(&mut self.buffer);
        let length = buffer.len();
        let mut position = 0;

        // `:`, `\r` and `\n` are ASCII and never occur inside a multi-byte
        // sequence, so byte offsets found here are valid char boundaries.
        {
            let bytes = buffer.as_bytes();
            while position < length {
                if self.discard_trailing_newline {
                    if bytes[position] == b'\n' {
                        position += 1;
                    }
                    self.discard_trailing_newline = false;
                    if position == length {
                        break;
                    }
                }

                let mut line_length = None;
                let mut field_length = self.starting_field_length;
                let mut index = position + self.starting_position;

                while index < length {
                    match bytes[index] {
                        b':' if field_length.is_none() => field_length = Some(index - position),
                        b'\r' => {
                            self.discard_trailing_newline = true;
                            line_length = Some(index - position);
                            break;
                        }
                        b'\n' => {
                            line_length = Some(index - position);
                            break;
                        }
                        _ => {}
                    }
                    index += 1;
                }

                let Some(line_length) = line_length else {
                    self.starting_position = length - position;
                    self.starting_field_length = field_length;
                    break;
                };
                self.starting_position = 0;
                self.starting_field_length = None;

                let line = &buffer[position..position + line_length];
                self.parse_line(line, field_length, &mut on_parse);

                position += line_length + 1;
            }
        }

        if position < length {
            buffer.drain(..position);
            self.buffer = buffer;
        }
    }

    fn parse_line<F>(&mut self, line: &str, field_length: Option<usize>, on_parse: &mut F)
    where
        F: FnMut(ParseEvent),
    {
        if line.is_empty() {
            self.dispatch(on_parse);
            return;
        }

        let (field, value) = match field_length {
            None => (line, ""),
            Some(colon) => {
                let rest = &line[colon + 1..];
                (&line[..colon], rest.strip_prefix(' ').unwrap_or(rest))
            }
        };

        match field {
            // Leading colon: comment.
            "" => {}
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "event" => self.event_name = Some(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Some(value) = parse_retry(value) {
                    tracing::trace!("SSE retry hint: {value}");
                    on_parse(ParseEvent::ReconnectInterval(ReconnectInterval { value }));
                }
            }
            _ => {}
        }
    }

    /// Blank line: emit the pending event if it has data. The event name is
    /// forgotten either way; the id only when an event went out.
    fn dispatch<F>(&mut self, on_parse: &mut F)
    where
        F: FnMut(ParseEvent),
    {
        let event_name = self.event_name.take();
        if self.data.is_empty() {
            return;
        }

        let mut data = std::mem::take(&mut self.data);
        data.pop();
        on_parse(ParseEvent::Event(ParsedEvent {
            id: self.event_id.take(),
            event: event_name.filter(|name| !name.is_empty()),
            data,
        }));
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_bom(buffer: &mut String) {
    if buffer.starts_with('\u{FEFF}') {
        buffer.drain(..'\u{FEFF}'.len_utf8());
    } else if buffer.chars().take(LATIN1_BOM.len()).eq(LATIN1_BOM) {
        let bom_len: usize = LATIN1_BOM.iter().map(|c| c.len_utf8()).sum();
        buffer.drain(..bom_len);
    }
}

/// Integer prefix of `value`, the way `parseInt(value, 10)` reads it.
fn parse_retry(value: &str) -> Option<i64> {
    let trimmed = value.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let parsed: i64 = digits[..end].parse().ok()?;
    Some(if negative { -parsed } else { parsed })
}
