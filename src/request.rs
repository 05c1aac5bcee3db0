use std::collections::HashMap;
use std::fmt;

/// Characters stripped by [`trim`]: space, tab, carriage return, newline.
pub const WHITESPACE: &[char] = &[' ', '\t', '\r', '\n'];

/// Body interpretation selected once from the request headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyKind {
    Raw,
    Chunked,
    FormData,
    UrlEncoded,
    #[default]
    None,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Structurally broken request: empty buffer, bad request line,
    /// header without a colon, empty key or value.
    Malformed,
    /// Declared Content-Length and received body length disagree.
    LengthMismatch {
        method: String,
        uri: String,
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::Malformed => write!(f, "malformed http request"),
            ParseError::LengthMismatch {
                method,
                uri,
                expected,
                actual,
            } => write!(
                f,
                "HTTP method [{}] at URI [{}] encountered a body length mismatch: \
                 expected Content-Length = {}, but received body length = {}",
                method, uri, expected, actual
            ),
        }
    }
}

impl std::error::Error for ParseError {}

/// A parsed HTTP/1.1 request.
///
/// Built from the full received buffer; the split step separates request
/// line, header block and body, and each piece is then interpreted on its
/// own so every step stays single-purpose.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    method: String,
    uri: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    kind: BodyKind,
    content_length: Option<usize>,
}

struct SplitRequest<'a> {
    request_line: &'a str,
    header_lines: Vec<&'a str>,
    body_lines: String,
}

impl HttpRequest {
    pub fn new() -> Self {
        HttpRequest::default()
    }

    /// Parses `data` into this request. On any failure the request must not
    /// be trusted; the error tells the caller whether the input was
    /// structurally broken or the body length did not match.
    pub fn parse(&mut self, data: &str) -> Result<(), ParseError> {
        let split = split_request_data(data).ok_or(ParseError::Malformed)?;
        self.parse_request_line(split.request_line)?;
        self.parse_headers(&split.header_lines)?;
        self.process_request_body(&split.body_lines)?;
        Ok(())
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let trimmed = trim(line);
        if trimmed.is_empty() {
            return Err(ParseError::Malformed);
        }
        // Tokens past the third are ignored, missing ones fail.
        let mut tokens = trimmed.split_whitespace();
        let method = tokens.next().unwrap_or("");
        let uri = tokens.next().unwrap_or("");
        let version = tokens.next().unwrap_or("");
        if method.is_empty() || uri.is_empty() || version.is_empty() {
            return Err(ParseError::Malformed);
        }
        self.method = method.to_string();
        self.uri = uri.to_string();
        self.version = version.to_string();
        Ok(())
    }

    fn parse_headers(&mut self, lines: &[&str]) -> Result<(), ParseError> {
        if lines.is_empty() {
            return Err(ParseError::Malformed);
        }
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let colon = line.find(':').ok_or(ParseError::Malformed)?;
            let key = trim(&line[..colon]);
            if key.is_empty() {
                return Err(ParseError::Malformed);
            }
            let value = trim(&line[colon + 1..]);
            if value.is_empty() {
                return Err(ParseError::Malformed);
            }
            // Duplicate keys: the first inserted value wins.
            self.headers
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }
        if let Some(value) = self.headers.get("Content-Length") {
            self.content_length = Some(to_size_t(value));
        }
        Ok(())
    }

    fn process_request_body(&mut self, body_lines: &str) -> Result<(), ParseError> {
        if !self.has_body() {
            return Ok(());
        }
        if self.content_length() == 0 {
            return Err(ParseError::Malformed);
        }
        let content_type = self.header("Content-Type").unwrap_or("");
        let transfer_encoding = self.header("Transfer-Encoding").unwrap_or("");
        if content_type == "application/json" || content_type == "text/plain" {
            self.set_body(body_lines, BodyKind::Raw)?;
        } else if transfer_encoding == "chunked" {
            self.set_body(body_lines, BodyKind::Chunked)?;
        } else if content_type.contains("multipart/form-data") {
            self.set_body(body_lines, BodyKind::FormData)?;
        } else if content_type == "application/x-www-form-urlencoded" {
            self.set_body(body_lines, BodyKind::UrlEncoded)?;
        }
        Ok(())
    }

    /// Stores the body, enforcing that its length equals the declared
    /// Content-Length exactly. A zero-length declaration is a no-op.
    pub fn set_body(&mut self, body: &str, kind: BodyKind) -> Result<(), ParseError> {
        if !self.has_body() || self.content_length() == 0 {
            return Ok(());
        }
        if body.len() != self.content_length() {
            return Err(ParseError::LengthMismatch {
                method: self.method.clone(),
                uri: self.uri.clone(),
                expected: self.content_length(),
                actual: body.len(),
            });
        }
        self.body = body.to_string();
        self.kind = kind;
        Ok(())
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn content_type(&self) -> &str {
        self.header("Content-Type").unwrap_or("")
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn body_kind(&self) -> BodyKind {
        self.kind
    }

    /// True when the request declared a Content-Length header.
    pub fn has_body(&self) -> bool {
        self.content_length.is_some()
    }

    pub fn content_length(&self) -> usize {
        self.content_length.unwrap_or(0)
    }

    pub fn is_connection_close(&self) -> bool {
        self.header("Connection") == Some("close")
    }
}

/// Separates the raw buffer into request line, header block and body lines.
///
/// Lines are `\n`-delimited with any `\r` retained; the header block runs up
/// to but excluding the first line that is a bare `\r`; the body is the rest,
/// re-joined with a newline after each line.
fn split_request_data(data: &str) -> Option<SplitRequest<'_>> {
    if data.is_empty() {
        return None;
    }
    let lines = split_lines(data);
    let (&request_line, rest) = lines.split_first()?;

    let mut header_lines = Vec::new();
    let mut it = rest.iter();
    for line in it.by_ref() {
        if *line == "\r" {
            break;
        }
        header_lines.push(*line);
    }

    let mut body_lines = String::new();
    if !header_lines.is_empty() {
        for line in it {
            body_lines.push_str(line);
            body_lines.push('\n');
        }
    }

    Some(SplitRequest {
        request_line,
        header_lines,
        body_lines,
    })
}

// Splits on '\n' without producing a phantom empty line after a trailing
// newline; each line keeps its '\r' if present.
fn split_lines(data: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = data.split('\n').collect();
    if data.ends_with('\n') {
        lines.pop();
    }
    lines
}

/// Removes leading and trailing [`WHITESPACE`] characters. Idempotent.
pub fn trim(s: &str) -> &str {
    s.trim_matches(WHITESPACE)
}

// Reads the leading unsigned integer of a header value, 0 when unparsable.
fn to_size_t(value: &str) -> usize {
    let digits: String = value
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

/// Whether `raw` holds a structurally complete request: the header block is
/// terminated and, when a Content-Length is declared, at least that many
/// body bytes (counted after line reassembly) have arrived. Used by the
/// event loop to decide between parsing now and waiting for more reads.
pub fn request_complete(raw: &str) -> bool {
    let head_end = match raw.find("\r\n\r\n") {
        Some(pos) => pos,
        None => return false,
    };
    for line in raw[..head_end].split('\n').skip(1) {
        if let Some(colon) = line.find(':') {
            if trim(&line[..colon]) == "Content-Length" {
                let expected = to_size_t(trim(&line[colon + 1..]));
                return assembled_body_len(&raw[head_end + 4..]) >= expected;
            }
        }
    }
    true
}

// Length of the body after the split/rejoin pass: every existing newline is
// preserved and a final one is appended when missing.
fn assembled_body_len(rest: &str) -> usize {
    if rest.is_empty() {
        0
    } else if rest.ends_with('\n') {
        rest.len()
    } else {
        rest.len() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(raw: &str) -> Result<HttpRequest, ParseError> {
        let mut request = HttpRequest::new();
        request.parse(raw)?;
        Ok(request)
    }

    #[test]
    fn parses_simple_get() {
        let request = parsed("GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(request.method(), "GET");
        assert_eq!(request.uri(), "/index.html");
        assert_eq!(request.version(), "HTTP/1.1");
        assert_eq!(request.header("Host"), Some("x"));
        assert!(!request.has_body());
        assert_eq!(request.body_kind(), BodyKind::None);
    }

    #[test]
    fn empty_buffer_fails() {
        assert_eq!(parsed("").unwrap_err(), ParseError::Malformed);
    }

    #[test]
    fn missing_request_line_token_fails() {
        assert_eq!(
            parsed("GET /only-two-tokens\r\nHost: x\r\n\r\n").unwrap_err(),
            ParseError::Malformed
        );
    }

    #[test]
    fn blank_request_line_fails() {
        assert_eq!(
            parsed("   \r\nHost: x\r\n\r\n").unwrap_err(),
            ParseError::Malformed
        );
    }

    #[test]
    fn extra_request_line_tokens_are_ignored() {
        let request = parsed("GET / HTTP/1.1 junk\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(request.version(), "HTTP/1.1");
    }

    #[test]
    fn header_without_colon_fails() {
        assert_eq!(
            parsed("GET / HTTP/1.1\r\nBadHeader\r\n\r\n").unwrap_err(),
            ParseError::Malformed
        );
    }

    #[test]
    fn empty_header_key_fails() {
        assert_eq!(
            parsed("GET / HTTP/1.1\r\n : value\r\n\r\n").unwrap_err(),
            ParseError::Malformed
        );
    }

    #[test]
    fn empty_header_value_fails() {
        assert_eq!(
            parsed("GET / HTTP/1.1\r\nHost: \r\n\r\n").unwrap_err(),
            ParseError::Malformed
        );
    }

    #[test]
    fn empty_header_block_fails() {
        assert_eq!(parsed("GET / HTTP/1.1\r\n\r\n").unwrap_err(), ParseError::Malformed);
    }

    #[test]
    fn duplicate_header_first_value_wins() {
        let request =
            parsed("GET / HTTP/1.1\r\nX-Tag: one\r\nX-Tag: two\r\n\r\n").unwrap();
        assert_eq!(request.header("X-Tag"), Some("one"));
    }

    #[test]
    fn trim_is_idempotent() {
        for s in ["  a b \r\n", "\t\r\n", "", "plain", " \t x"] {
            assert_eq!(trim(trim(s)), trim(s));
        }
    }

    #[test]
    fn raw_body_with_matching_length() {
        let request = parsed(
            "POST /submit HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 6\r\n\r\nhello\n",
        )
        .unwrap();
        assert!(request.has_body());
        assert_eq!(request.content_length(), 6);
        assert_eq!(request.body(), "hello\n");
        assert_eq!(request.body_kind(), BodyKind::Raw);
    }

    #[test]
    fn body_length_mismatch_fails_and_leaves_body_empty() {
        let mut request = HttpRequest::new();
        let err = request
            .parse(
                "POST /submit HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nab\r\n",
            )
            .unwrap_err();
        match err {
            ParseError::LengthMismatch {
                method,
                uri,
                expected,
                actual,
            } => {
                assert_eq!(method, "POST");
                assert_eq!(uri, "/submit");
                assert_eq!(expected, 5);
                assert_eq!(actual, 4);
            }
            other => panic!("expected length mismatch, got {:?}", other),
        }
        assert!(request.body().is_empty());
    }

    #[test]
    fn zero_content_length_fails() {
        assert_eq!(
            parsed("POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n").unwrap_err(),
            ParseError::Malformed
        );
    }

    #[test]
    fn unknown_content_type_leaves_body_unset() {
        let request = parsed(
            "POST / HTTP/1.1\r\nContent-Type: application/octet-stream\r\nContent-Length: 4\r\n\r\nab\r\n",
        )
        .unwrap();
        assert!(request.body().is_empty());
        assert_eq!(request.body_kind(), BodyKind::None);
    }

    #[test]
    fn chunked_transfer_encoding_tags_body() {
        let request = parsed(
            "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 4\r\n\r\nab\r\n",
        )
        .unwrap();
        assert_eq!(request.body_kind(), BodyKind::Chunked);
        assert_eq!(request.body(), "ab\r\n");
    }

    #[test]
    fn url_encoded_body_is_tagged() {
        let request = parsed(
            "POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 8\r\n\r\na=1&b=2\n",
        )
        .unwrap();
        assert_eq!(request.body_kind(), BodyKind::UrlEncoded);
        assert_eq!(request.body(), "a=1&b=2\n");
    }

    #[test]
    fn connection_close_probe() {
        let request = parsed("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(request.is_connection_close());
        let request = parsed("GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert!(!request.is_connection_close());
    }

    #[test]
    fn completeness_header_only() {
        assert!(request_complete("GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert!(!request_complete("GET / HTTP/1.1\r\nHost: x\r\n"));
    }

    #[test]
    fn completeness_waits_for_declared_body() {
        let head = "POST / HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 6\r\n\r\n";
        assert!(!request_complete(head));
        assert!(!request_complete(&format!("{}hel", head)));
        assert!(request_complete(&format!("{}hello\n", head)));
    }

    #[test]
    fn content_length_takes_leading_digits() {
        let request = parsed("POST / HTTP/1.1\r\nContent-Length: 12abc\r\n\r\n").unwrap();
        assert_eq!(request.content_length(), 12);
        assert_eq!(to_size_t("  42xyz"), 42);
        assert_eq!(to_size_t("nope"), 0);
    }
}
