//! HTTP/1.1 wire parser.
//!
//! The request line and every header field are validated against anchored
//! patterns compiled once at first use. Obsolete line folding (RFC 7230
//! §3.2.4) is accepted: continuation lines are joined to the prior value
//! with a single space.
//!
//! Parsing is suspension-friendly: both [`parse_head`] and
//! [`BodyDecoder::advance`] return [`ParseStatus::Partial`] when the buffer
//! does not yet hold enough bytes, and the connection loop feeds more data
//! and retries.

use std::sync::LazyLock;

use bytes::Bytes;
use regex::bytes::Regex;

use crate::buffer::ReceiveBuffer;
use crate::error::ServerError;
use crate::http::{Headers, Method};

static REQUEST_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?-u)^(?P<method>[!#$%&'*+\-.^_`|~0-9A-Za-z]+) (?P<target>[\x21-\x7e]+) HTTP/(?P<version>[0-9]\.[0-9])$",
    )
    .expect("request-line pattern")
});

static HEADER_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?-u)^(?P<field_name>[!#$%&'*+\-.^_`|~0-9A-Za-z]+):[ \t]*(?P<field_value>.*?)[ \t]*$",
    )
    .expect("header-field pattern")
});

/// Outcome of one parse attempt over the current buffer contents.
#[derive(Debug)]
pub enum ParseStatus<T> {
    Complete(T),
    /// Not enough bytes buffered yet; append more and retry.
    Partial,
}

/// The validated request line plus the decoded header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: Headers,
    pub expect_continue: bool,
}

/// How the body bytes will be acquired, decided from the completed header
/// set in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Length(usize),
    Chunked,
}

/// Extract and validate the request line and headers.
pub fn parse_head(buf: &mut ReceiveBuffer) -> Result<ParseStatus<RequestHead>, ServerError> {
    let Some(lines) = buf.maybe_extract_lines() else {
        if buf.is_next_line_obviously_invalid_request_line() {
            return Err(ServerError::BadRequest("Bad request line".to_string()));
        }
        return Ok(ParseStatus::Partial);
    };

    if lines.is_empty() {
        return Err(ServerError::BadRequest("No lines received".to_string()));
    }

    let captures = REQUEST_LINE_RE.captures(&lines[0]).ok_or_else(|| {
        ServerError::BadRequest(format!(
            "illegal request line: {}",
            String::from_utf8_lossy(&lines[0])
        ))
    })?;

    let method = Method::from_bytes(&captures["method"]);
    let target = String::from_utf8(captures["target"].to_vec())
        .map_err(|_| ServerError::BadRequest("illegal request target".to_string()))?;
    let version = String::from_utf8(captures["version"].to_vec())
        .map_err(|_| ServerError::BadRequest("illegal protocol version".to_string()))?;

    let headers = decode_header_lines(&lines[1..])?;

    if !headers.contains("host") {
        return Err(ServerError::BadRequest("Missing Host header".to_string()));
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.clone(), None),
    };

    let expect_continue = headers
        .get("expect")
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false);

    Ok(ParseStatus::Complete(RequestHead {
        method,
        target,
        path,
        query,
        version,
        headers,
        expect_continue,
    }))
}

/// Join obsolete line folds, then validate and split each header line.
fn decode_header_lines(lines: &[Bytes]) -> Result<Headers, ServerError> {
    let mut folded: Vec<Vec<u8>> = Vec::with_capacity(lines.len());

    for line in lines {
        let continuation = line.first().is_some_and(|b| *b == b' ' || *b == b'\t');
        if continuation {
            let Some(last) = folded.last_mut() else {
                return Err(ServerError::BadRequest(
                    "continuation line at start of headers".to_string(),
                ));
            };
            let trimmed: &[u8] = {
                let mut rest = line.as_ref();
                while let Some((first, tail)) = rest.split_first() {
                    if *first == b' ' || *first == b'\t' {
                        rest = tail;
                    } else {
                        break;
                    }
                }
                rest
            };
            last.push(b' ');
            last.extend_from_slice(trimmed);
        } else {
            folded.push(line.to_vec());
        }
    }

    let mut headers = Headers::new();
    for line in &folded {
        let captures = HEADER_FIELD_RE.captures(line).ok_or_else(|| {
            ServerError::BadRequest(format!(
                "illegal header line: {}",
                String::from_utf8_lossy(line)
            ))
        })?;

        let name = String::from_utf8(captures["field_name"].to_vec())
            .map_err(|_| ServerError::BadRequest("illegal header name".to_string()))?;
        let value = String::from_utf8_lossy(&captures["field_value"]).into_owned();
        headers.insert(&name, value);
    }

    Ok(headers)
}

/// Decide body acquisition from the completed header set.
///
/// Precedence: `Transfer-Encoding` (chunked) over `Content-Length`; a
/// bodyless POST/PUT/PATCH is a 400; anything else carries no body.
pub fn body_plan(head: &RequestHead) -> Result<BodyPlan, ServerError> {
    if head.headers.contains("transfer-encoding") {
        return Ok(BodyPlan::Chunked);
    }

    if let Some(raw) = head.headers.get("content-length") {
        let length = raw
            .trim()
            .parse::<usize>()
            .map_err(|_| ServerError::BadRequest(format!("invalid Content-Length: {raw}")))?;
        return Ok(BodyPlan::Length(length));
    }

    if head.method.expects_body() {
        return Err(ServerError::BadRequest(
            "No Content-Length or Transfer-Encoding header supplied".to_string(),
        ));
    }

    Ok(BodyPlan::Empty)
}

/// Incremental body reader. Holds its progress across `Partial` returns so
/// a suspended read resumes where it left off.
#[derive(Debug)]
pub enum BodyDecoder {
    Empty,
    Length(LengthDecoder),
    Chunked(ChunkedDecoder),
}

impl BodyDecoder {
    pub fn new(plan: BodyPlan) -> Self {
        match plan {
            BodyPlan::Empty | BodyPlan::Length(0) => BodyDecoder::Empty,
            BodyPlan::Length(length) => BodyDecoder::Length(LengthDecoder {
                want: length,
                data: Vec::with_capacity(length),
            }),
            BodyPlan::Chunked => BodyDecoder::Chunked(ChunkedDecoder {
                data: Vec::new(),
                state: ChunkState::Size,
            }),
        }
    }

    pub fn advance(&mut self, buf: &mut ReceiveBuffer) -> Result<ParseStatus<Vec<u8>>, ServerError> {
        match self {
            BodyDecoder::Empty => Ok(ParseStatus::Complete(Vec::new())),
            BodyDecoder::Length(decoder) => decoder.advance(buf),
            BodyDecoder::Chunked(decoder) => decoder.advance(buf),
        }
    }
}

/// Reads `Content-Length` bytes, granting one sentinel byte of tolerance
/// on the declared length: a body one byte short of its header still
/// completes rather than stalling the read.
#[derive(Debug)]
pub struct LengthDecoder {
    want: usize,
    data: Vec<u8>,
}

impl LengthDecoder {
    fn advance(&mut self, buf: &mut ReceiveBuffer) -> Result<ParseStatus<Vec<u8>>, ServerError> {
        while self.data.len() < self.want {
            match buf.maybe_extract_at_most(self.want - self.data.len()) {
                Some(chunk) => self.data.extend_from_slice(&chunk),
                None => break,
            }
        }
        if self.data.len() + 1 >= self.want {
            return Ok(ParseStatus::Complete(std::mem::take(&mut self.data)));
        }
        Ok(ParseStatus::Partial)
    }
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data { need: usize, size: usize, got: Vec<u8> },
    Trailer,
    Done,
}

/// Decodes `Transfer-Encoding: chunked`: a hex size line, then exactly
/// `size + 2` bytes (data plus CRLF), repeated until a zero-size chunk.
#[derive(Debug)]
pub struct ChunkedDecoder {
    data: Vec<u8>,
    state: ChunkState,
}

impl ChunkedDecoder {
    fn advance(&mut self, buf: &mut ReceiveBuffer) -> Result<ParseStatus<Vec<u8>>, ServerError> {
        loop {
            match &mut self.state {
                ChunkState::Size => {
                    let Some(line) = buf.maybe_extract_next_line() else {
                        return Ok(ParseStatus::Partial);
                    };
                    let hex = std::str::from_utf8(&line)
                        .map_err(|_| ServerError::BadRequest("illegal chunk size".to_string()))?;
                    let size = usize::from_str_radix(hex.trim(), 16)
                        .map_err(|_| ServerError::BadRequest(format!("illegal chunk size: {hex}")))?;

                    if size == 0 {
                        self.state = ChunkState::Trailer;
                    } else {
                        self.state = ChunkState::Data {
                            need: size + 2,
                            size,
                            got: Vec::with_capacity(size + 2),
                        };
                    }
                }
                ChunkState::Data { need, size, got } => {
                    while got.len() < *need {
                        match buf.maybe_extract_at_most(*need - got.len()) {
                            Some(chunk) => got.extend_from_slice(&chunk),
                            None => return Ok(ParseStatus::Partial),
                        }
                    }
                    self.data.extend_from_slice(&got[..*size]);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    // Consume trailer lines through the terminating blank one.
                    let Some(line) = buf.maybe_extract_next_line() else {
                        return Ok(ParseStatus::Partial);
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => {
                    return Ok(ParseStatus::Complete(std::mem::take(&mut self.data)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_of(raw: &[u8]) -> RequestHead {
        let mut buf = ReceiveBuffer::new();
        buf.extend(raw);
        match parse_head(&mut buf).unwrap() {
            ParseStatus::Complete(head) => head,
            ParseStatus::Partial => panic!("expected a complete head"),
        }
    }

    #[test]
    fn test_parse_basic_head() {
        let head = head_of(b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.path, "/some/path");
        assert_eq!(head.query.as_deref(), Some("foo=bar"));
        assert_eq!(head.version, "1.1");
        assert_eq!(head.headers.get("host"), Some("localhost"));
        assert!(!head.expect_continue);
    }

    #[test]
    fn test_request_line_round_trip() {
        let head = head_of(b"GET /a/b?x=1 HTTP/1.1\r\nHost: x\r\n\r\n");
        let line = format!("{} {} HTTP/{}", head.method.as_str(), head.target, head.version);
        assert_eq!(line, "GET /a/b?x=1 HTTP/1.1");
    }

    #[test]
    fn test_parse_incomplete_head() {
        let mut buf = ReceiveBuffer::new();
        buf.extend(b"GET /some/path HTTP/1.1\r\nHost: x\r\n");
        assert!(matches!(parse_head(&mut buf), Ok(ParseStatus::Partial)));
    }

    #[test]
    fn test_parse_rejects_garbage_before_crlf() {
        let mut buf = ReceiveBuffer::new();
        buf.extend(b"\x16\x03\x01\x02");
        assert!(parse_head(&mut buf).is_err());
    }

    #[test]
    fn test_parse_missing_host() {
        let mut buf = ReceiveBuffer::new();
        buf.extend(b"GET / HTTP/1.1\r\n\r\n");
        assert!(matches!(
            parse_head(&mut buf),
            Err(ServerError::BadRequest(msg)) if msg.contains("Host")
        ));
    }

    #[test]
    fn test_parse_illegal_header_line() {
        let mut buf = ReceiveBuffer::new();
        buf.extend(b"GET / HTTP/1.1\r\nHost: x\r\nbad header\r\n\r\n");
        assert!(matches!(
            parse_head(&mut buf),
            Err(ServerError::BadRequest(msg)) if msg.contains("illegal header line")
        ));
    }

    #[test]
    fn test_obsolete_line_folding() {
        let head = head_of(
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Folded: first\r\n  second\r\n\tthird\r\n\r\n",
        );
        assert_eq!(head.headers.get("x-folded"), Some("first second third"));
    }

    #[test]
    fn test_header_ows_trimmed() {
        let head = head_of(b"GET / HTTP/1.1\r\nHost: x\r\nX-Pad: \t padded \t \r\n\r\n");
        assert_eq!(head.headers.get("x-pad"), Some("padded"));
    }

    #[test]
    fn test_expect_continue_flag() {
        let head = head_of(
            b"POST /u HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n",
        );
        assert!(head.expect_continue);
    }

    #[test]
    fn test_body_plan_precedence() {
        let head = head_of(
            b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert_eq!(body_plan(&head).unwrap(), BodyPlan::Chunked);

        let head = head_of(b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\n");
        assert_eq!(body_plan(&head).unwrap(), BodyPlan::Length(4));

        let head = head_of(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(body_plan(&head).unwrap(), BodyPlan::Empty);
    }

    #[test]
    fn test_bodyless_post_is_rejected() {
        let head = head_of(b"POST /u HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(matches!(
            body_plan(&head),
            Err(ServerError::BadRequest(msg))
                if msg == "No Content-Length or Transfer-Encoding header supplied"
        ));
    }

    #[test]
    fn test_length_decoder_resumes() {
        let mut buf = ReceiveBuffer::new();
        let mut decoder = BodyDecoder::new(BodyPlan::Length(10));

        buf.extend(b"hello");
        assert!(matches!(decoder.advance(&mut buf), Ok(ParseStatus::Partial)));

        buf.extend(b"worldextra");
        match decoder.advance(&mut buf).unwrap() {
            ParseStatus::Complete(body) => assert_eq!(body, b"helloworld"),
            ParseStatus::Partial => panic!("expected a complete body"),
        }
        assert_eq!(buf.as_slice(), b"extra");
    }

    #[test]
    fn test_length_decoder_sentinel_tolerance() {
        // A body one byte short of the declared length still completes.
        let mut buf = ReceiveBuffer::new();
        let mut decoder = BodyDecoder::new(BodyPlan::Length(17));

        buf.extend(br#"{"message":"hi"}"#);
        match decoder.advance(&mut buf).unwrap() {
            ParseStatus::Complete(body) => assert_eq!(body, br#"{"message":"hi"}"#),
            ParseStatus::Partial => panic!("expected completion one byte short"),
        }

        // Two bytes short keeps waiting.
        let mut buf = ReceiveBuffer::new();
        let mut decoder = BodyDecoder::new(BodyPlan::Length(18));
        buf.extend(br#"{"message":"hi"}"#);
        assert!(matches!(decoder.advance(&mut buf), Ok(ParseStatus::Partial)));
    }

    #[test]
    fn test_zero_length_body() {
        let mut buf = ReceiveBuffer::new();
        let mut decoder = BodyDecoder::new(BodyPlan::Length(0));
        match decoder.advance(&mut buf).unwrap() {
            ParseStatus::Complete(body) => assert!(body.is_empty()),
            ParseStatus::Partial => panic!("zero-length body never suspends"),
        }
    }

    #[test]
    fn test_chunked_decoder() {
        let mut buf = ReceiveBuffer::new();
        buf.extend(b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n");
        let mut decoder = BodyDecoder::new(BodyPlan::Chunked);
        match decoder.advance(&mut buf).unwrap() {
            ParseStatus::Complete(body) => assert_eq!(body, b"wikipedia"),
            ParseStatus::Partial => panic!("expected a complete body"),
        }
    }

    #[test]
    fn test_chunked_decoder_resumes_mid_chunk() {
        let mut buf = ReceiveBuffer::new();
        let mut decoder = BodyDecoder::new(BodyPlan::Chunked);

        buf.extend(b"4\r\nwi");
        assert!(matches!(decoder.advance(&mut buf), Ok(ParseStatus::Partial)));

        buf.extend(b"ki\r\n0\r\n");
        assert!(matches!(decoder.advance(&mut buf), Ok(ParseStatus::Partial)));

        buf.extend(b"\r\n");
        match decoder.advance(&mut buf).unwrap() {
            ParseStatus::Complete(body) => assert_eq!(body, b"wiki"),
            ParseStatus::Partial => panic!("expected a complete body"),
        }
    }

    #[test]
    fn test_zero_length_chunked_body() {
        let mut buf = ReceiveBuffer::new();
        buf.extend(b"0\r\n\r\n");
        let mut decoder = BodyDecoder::new(BodyPlan::Chunked);
        match decoder.advance(&mut buf).unwrap() {
            ParseStatus::Complete(body) => assert!(body.is_empty()),
            ParseStatus::Partial => panic!("expected a complete body"),
        }
    }
}
