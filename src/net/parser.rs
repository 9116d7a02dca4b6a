//! HTTP parser boundary (spec §1 Out of scope / §4.G Read path).
//!
//! The message parser itself is an external collaborator: the core only
//! needs a byte-oriented state machine that reports where the URL and
//! body start, and when a message is complete. This module defines that
//! boundary plus a minimal reference implementation (HTTP/1.x request
//! line + headers, no pipelining) so the connection state machine and
//! its tests have something concrete to drive.

/// Offsets into the connection's input buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsedUrl {
    pub offset: u32,
    pub len: u32,
}

/// What the parser reports back to the connection state machine as it
/// consumes bytes.
pub trait ParserCallbacks {
    fn on_url(&mut self, url: ParsedUrl);
    fn on_body(&mut self, offset: u32, len: u32);
    fn on_message_complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Consumed all available bytes; message not yet complete.
    NeedMore,
    /// The message is complete; value is the number of bytes consumed
    /// from the start of the buffer (any remainder belongs to the next
    /// pipelined message, which this core does not support -- callers
    /// should treat a non-empty remainder as a protocol error).
    Complete(usize),
    /// The bytes could not be parsed as HTTP.
    Error,
}

/// Byte-oriented, restartable HTTP/1.x request parser. Not a full
/// conformance parser -- just enough of the request line and header
/// block to exercise the connection state machine above it.
#[derive(Default)]
pub struct HttpRequestParser {
    headers_done: bool,
}

impl HttpRequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.headers_done = false;
    }

    /// Parses as much of `buf` as possible, reporting URL/body offsets
    /// and completion through `callbacks`.
    pub fn parse(&mut self, buf: &[u8], callbacks: &mut impl ParserCallbacks) -> ParseOutcome {
        let header_end = match find_header_end(buf) {
            Some(idx) => idx,
            None => return ParseOutcome::NeedMore,
        };

        let request_line_end = match buf[..header_end].iter().position(|&b| b == b'\n') {
            Some(idx) => idx,
            None => return ParseOutcome::Error,
        };
        let request_line = &buf[..request_line_end];
        let request_line = strip_trailing_cr(request_line);

        let mut parts = request_line.split(|&b| b == b' ');
        let _method = match parts.next() {
            Some(m) if !m.is_empty() => m,
            _ => return ParseOutcome::Error,
        };
        let url = match parts.next() {
            Some(u) if !u.is_empty() => u,
            _ => return ParseOutcome::Error,
        };
        let url_offset = (_method.len() + 1) as u32;

        if !self.headers_done {
            callbacks.on_url(ParsedUrl {
                offset: url_offset,
                len: url.len() as u32,
            });
            self.headers_done = true;
        }

        let content_length = parse_content_length(&buf[..header_end]);
        let body_offset = header_end;
        let body_available = buf.len().saturating_sub(body_offset);

        match content_length {
            0 => {
                callbacks.on_body(body_offset as u32, 0);
                callbacks.on_message_complete();
                ParseOutcome::Complete(body_offset)
            }
            needed if body_available >= needed => {
                callbacks.on_body(body_offset as u32, needed as u32);
                callbacks.on_message_complete();
                ParseOutcome::Complete(body_offset + needed)
            }
            _ => ParseOutcome::NeedMore,
        }
    }
}

fn strip_trailing_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_content_length(headers: &[u8]) -> usize {
    for line in headers.split(|&b| b == b'\n') {
        let line = strip_trailing_cr(line);
        if let Some(rest) = strip_prefix_ci(line, b"content-length:") {
            let text = std::str::from_utf8(rest).unwrap_or("").trim();
            return text.parse().unwrap_or(0);
        }
    }
    0
}

fn strip_prefix_ci<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if line.len() < prefix.len() {
        return None;
    }
    for (a, b) in line[..prefix.len()].iter().zip(prefix) {
        if a.to_ascii_lowercase() != *b {
            return None;
        }
    }
    Some(&line[prefix.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        url: Option<ParsedUrl>,
        body: Option<(u32, u32)>,
        complete: bool,
    }

    impl ParserCallbacks for Recorder {
        fn on_url(&mut self, url: ParsedUrl) {
            self.url = Some(url);
        }
        fn on_body(&mut self, offset: u32, len: u32) {
            self.body = Some((offset, len));
        }
        fn on_message_complete(&mut self) {
            self.complete = true;
        }
    }

    #[test]
    fn parses_get_with_no_body() {
        let mut parser = HttpRequestParser::new();
        let mut rec = Recorder::default();
        let req = b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n";
        let outcome = parser.parse(req, &mut rec);
        assert_eq!(outcome, ParseOutcome::Complete(req.len()));
        assert!(rec.complete);
        let url = rec.url.unwrap();
        assert_eq!(&req[url.offset as usize..(url.offset + url.len) as usize], b"/hello");
    }

    #[test]
    fn waits_for_full_body() {
        let mut parser = HttpRequestParser::new();
        let mut rec = Recorder::default();
        let req = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert_eq!(parser.parse(req, &mut rec), ParseOutcome::NeedMore);

        let full = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut rec2 = Recorder::default();
        let mut parser2 = HttpRequestParser::new();
        assert_eq!(parser2.parse(full, &mut rec2), ParseOutcome::Complete(full.len()));
        assert_eq!(rec2.body, Some((full.len() as u32 - 5, 5)));
    }

    #[test]
    fn rejects_missing_url() {
        let mut parser = HttpRequestParser::new();
        let mut rec = Recorder::default();
        assert_eq!(parser.parse(b"GET\r\n\r\n", &mut rec), ParseOutcome::Error);
    }
}
