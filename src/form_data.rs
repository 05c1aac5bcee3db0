use std::collections::HashMap;

use crate::request::{trim, HttpRequest};

/// Whitespace in uploaded filenames is replaced with this character before
/// any filesystem use.
pub const REPLACEMENT_FILENAME_CHAR: char = '_';

/// The first part of a `multipart/form-data` body.
///
/// Structural problems never raise an error here; the parser simply leaves
/// the value invalid, and callers must check [`FormData::is_valid`] before
/// trusting any accessor.
#[derive(Debug, Default)]
pub struct FormData {
    disposition: HashMap<String, String>,
    headers: HashMap<String, String>,
    content: String,
    boundary: String,
    is_valid: bool,
}

// Raw pieces of one part before validation: the Content-Disposition line,
// the header block and the content.
#[derive(Default)]
struct Parts {
    disposition: String,
    header_block: String,
    content: String,
}

impl FormData {
    /// Extracts the first boundary-delimited part from the request body.
    pub fn from_request(request: &HttpRequest) -> FormData {
        let mut form = FormData::default();
        form.parse(request.body(), request.content_type());
        form
    }

    fn parse(&mut self, body: &str, content_type: &str) {
        if body.is_empty() || content_type.is_empty() {
            return;
        }
        let boundary = match extract_boundary(content_type) {
            Some(b) => b,
            None => return,
        };
        self.boundary = boundary;
        self.is_valid = self.parse_first_part(body);
    }

    fn parse_first_part(&mut self, body: &str) -> bool {
        if !check_boundary(body, &self.boundary) {
            return false;
        }
        let region = match extract_part_region(body, &self.boundary) {
            Some(r) => r,
            None => return false,
        };
        let parts = split_to_parts(region);
        self.build(parts)
    }

    fn build(&mut self, parts: Parts) -> bool {
        if parts.disposition.is_empty()
            || parts.header_block.is_empty()
            || parts.content.is_empty()
        {
            return false;
        }
        let disposition = match parse_content_disposition(&parts.disposition) {
            Some(d) => d,
            None => return false,
        };
        let headers = match parse_part_headers(&parts.header_block) {
            Some(h) => h,
            None => return false,
        };
        self.disposition = disposition;
        self.headers = headers;
        self.content = parts.content;
        true
    }

    pub fn disposition(&self) -> &HashMap<String, String> {
        &self.disposition
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn filename(&self) -> Option<&str> {
        self.disposition.get("filename").map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type").map(String::as_str)
    }

    /// Lazy walk over every part of `body`, terminating at the
    /// `--boundary--` end marker. Each part is validated independently.
    pub fn parts<'a>(body: &'a str, content_type: &str) -> PartsIter<'a> {
        let boundary = extract_boundary(content_type).unwrap_or_default();
        PartsIter::new(body, boundary)
    }
}

/// One boundary-delimited segment yielded by [`FormData::parts`].
#[derive(Debug, Default)]
pub struct FormPart {
    pub disposition: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub content: String,
    pub is_valid: bool,
}

pub struct PartsIter<'a> {
    body: &'a str,
    full_boundary: String,
    pos: usize,
    done: bool,
}

impl<'a> PartsIter<'a> {
    fn new(body: &'a str, boundary: String) -> Self {
        let full_boundary = format!("--{}", boundary);
        let done = boundary.is_empty() || !body.starts_with(&full_boundary);
        PartsIter {
            body,
            full_boundary,
            pos: 0,
            done,
        }
    }
}

impl Iterator for PartsIter<'_> {
    type Item = FormPart;

    fn next(&mut self) -> Option<FormPart> {
        if self.done {
            return None;
        }
        let body = self.body;
        let rest = &body[self.pos..];
        if !rest.starts_with(&self.full_boundary) {
            self.done = true;
            return None;
        }
        let after_marker = &rest[self.full_boundary.len()..];
        // `--boundary--` terminates the scan.
        if after_marker.starts_with("--") {
            self.done = true;
            return None;
        }
        let region_start = match after_marker.find("\r\n") {
            Some(p) => self.full_boundary.len() + p + 2,
            None => {
                self.done = true;
                return None;
            }
        };
        let region_end = match rest[region_start..].find(&self.full_boundary) {
            Some(p) => region_start + p,
            None => {
                self.done = true;
                return None;
            }
        };
        self.pos += region_end;
        let parts = split_to_parts(&rest[region_start..region_end]);

        let mut part = FormPart::default();
        if parts.disposition.is_empty()
            || parts.header_block.is_empty()
            || parts.content.is_empty()
        {
            return Some(part);
        }
        match (
            parse_content_disposition(&parts.disposition),
            parse_part_headers(&parts.header_block),
        ) {
            (Some(disposition), Some(headers)) => {
                part.disposition = disposition;
                part.headers = headers;
                part.content = parts.content;
                part.is_valid = true;
            }
            _ => {}
        }
        Some(part)
    }
}

/// Replaces every whitespace character in `name` with
/// [`REPLACEMENT_FILENAME_CHAR`].
pub fn clear_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_whitespace() {
                REPLACEMENT_FILENAME_CHAR
            } else {
                c
            }
        })
        .collect()
}

// Pulls the boundary token out of the Content-Type parameter list, cutting
// at a CRLF when the parameter runs into trailing header text.
fn extract_boundary(content_type: &str) -> Option<String> {
    const PREFIX: &str = "boundary=";
    let start = content_type.find(PREFIX)? + PREFIX.len();
    let mut boundary = &content_type[start..];
    if let Some(end) = boundary.find("\r\n") {
        boundary = &boundary[..end];
    }
    if boundary.is_empty() {
        return None;
    }
    Some(boundary.to_string())
}

fn check_boundary(body: &str, boundary: &str) -> bool {
    body.starts_with(&format!("--{}", boundary))
}

// The bytes between the end of the opening boundary line and the next
// occurrence of `--boundary`. None when either offset is missing, i.e. the
// part has no closing boundary.
fn extract_part_region<'a>(body: &'a str, boundary: &str) -> Option<&'a str> {
    let full_boundary = format!("--{}", boundary);
    let start = body[full_boundary.len()..]
        .find("\r\n")
        .map(|p| full_boundary.len() + p + 2)?;
    let end = body[start..].find(&full_boundary).map(|p| start + p)?;
    Some(&body[start..end])
}

// Three-way split of a part region: the disposition line (must carry the
// Content-Disposition token, otherwise everything stays empty), the header
// lines up to a bare-CR terminator, and the remaining content. Header and
// content lines are re-joined with a newline after each line.
fn split_to_parts(region: &str) -> Parts {
    let mut parts = Parts::default();
    let mut lines = split_lines(region).into_iter();
    match lines.next() {
        Some(line) if line.contains("Content-Disposition") => {
            parts.disposition = line.to_string();
        }
        _ => return parts,
    }
    for line in lines.by_ref() {
        if line == "\r" {
            break;
        }
        parts.header_block.push_str(line);
        parts.header_block.push('\n');
    }
    for line in lines {
        parts.content.push_str(line);
        parts.content.push('\n');
    }
    parts
}

// Semicolon-separated key=value tokens; the leading bare `form-data` marker
// is discarded and double quotes are stripped from quoted values. A `name`
// parameter is required.
fn parse_content_disposition(line: &str) -> Option<HashMap<String, String>> {
    let mut disposition = HashMap::new();
    for token in line.split(';').skip(1) {
        let token = trim(token);
        if let Some(equal) = token.find('=') {
            let key = trim(&token[..equal]);
            let mut value = trim(&token[equal + 1..]);
            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }
            disposition.insert(key.to_string(), value.to_string());
        }
    }
    if !disposition.contains_key("name") {
        return None;
    }
    Some(disposition)
}

// Colon-separated `Key: value` lines, both sides trimmed; a Content-Type
// entry is required.
fn parse_part_headers(block: &str) -> Option<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for line in split_lines(block) {
        if let Some(colon) = line.find(':') {
            let key = trim(&line[..colon]);
            let value = trim(&line[colon + 1..]);
            if !key.is_empty() && !value.is_empty() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
    }
    if headers.is_empty() || !headers.contains_key("Content-Type") {
        return None;
    }
    Some(headers)
}

fn split_lines(data: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = data.split('\n').collect();
    if data.ends_with('\n') {
        lines.pop();
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HttpRequest;

    const BODY: &str = "--B\r\nContent-Disposition: form-data; name=\"field\"\r\nContent-Type: text/plain\r\n\r\nhello\r\n--B";
    const CONTENT_TYPE: &str = "multipart/form-data; boundary=B";

    fn multipart_request(body: &str, content_type: &str) -> HttpRequest {
        let raw = format!(
            "POST /upload HTTP/1.1\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
            content_type,
            body.len() + 1,
            body
        );
        let mut request = HttpRequest::new();
        request.parse(&raw).unwrap();
        request
    }

    #[test]
    fn parses_single_part() {
        let request = multipart_request(BODY, CONTENT_TYPE);
        let form = FormData::from_request(&request);
        assert!(form.is_valid());
        assert_eq!(form.disposition().get("name").unwrap(), "field");
        assert_eq!(form.headers().get("Content-Type").unwrap(), "text/plain");
        assert!(form.content().contains("hello"));
        assert_eq!(form.boundary(), "B");
        assert_eq!(form.content_type(), Some("text/plain"));
    }

    #[test]
    fn missing_name_parameter_is_invalid() {
        let body = "--B\r\nContent-Disposition: form-data; other=\"x\"\r\nContent-Type: text/plain\r\n\r\nhello\r\n--B";
        let request = multipart_request(body, CONTENT_TYPE);
        let form = FormData::from_request(&request);
        assert!(!form.is_valid());
    }

    #[test]
    fn missing_part_content_type_is_invalid() {
        let body = "--B\r\nContent-Disposition: form-data; name=\"field\"\r\nX-Other: y\r\n\r\nhello\r\n--B";
        let request = multipart_request(body, CONTENT_TYPE);
        assert!(!FormData::from_request(&request).is_valid());
    }

    #[test]
    fn empty_body_or_content_type_stays_invalid() {
        let form = {
            let mut f = FormData::default();
            f.parse("", CONTENT_TYPE);
            f
        };
        assert!(!form.is_valid());
        let form = {
            let mut f = FormData::default();
            f.parse(BODY, "");
            f
        };
        assert!(!form.is_valid());
    }

    #[test]
    fn missing_boundary_parameter_is_invalid() {
        let request = multipart_request(BODY, "multipart/form-data");
        let form = FormData::from_request(&request);
        assert!(!form.is_valid());
        assert_eq!(form.boundary(), "");
    }

    #[test]
    fn body_not_opening_with_boundary_is_invalid() {
        let body = "junk\r\n--B\r\nContent-Disposition: form-data; name=\"f\"\r\nContent-Type: text/plain\r\n\r\nhello\r\n--B";
        let request = multipart_request(body, CONTENT_TYPE);
        assert!(!FormData::from_request(&request).is_valid());
    }

    #[test]
    fn part_without_closing_boundary_is_invalid() {
        let body = "--B\r\nContent-Disposition: form-data; name=\"f\"\r\nContent-Type: text/plain\r\n\r\nhello";
        let request = multipart_request(body, CONTENT_TYPE);
        assert!(!FormData::from_request(&request).is_valid());
    }

    #[test]
    fn boundary_trimmed_at_crlf() {
        assert_eq!(
            extract_boundary("multipart/form-data; boundary=B\r\nX-Next: y"),
            Some("B".to_string())
        );
        assert_eq!(extract_boundary("multipart/form-data; boundary="), None);
    }

    #[test]
    fn filename_accessor_and_cleanup() {
        let body = "--B\r\nContent-Disposition: form-data; name=\"file\"; filename=\"my report.txt\"\r\nContent-Type: text/plain\r\n\r\ndata\r\n--B";
        let request = multipart_request(body, CONTENT_TYPE);
        let form = FormData::from_request(&request);
        assert!(form.is_valid());
        assert_eq!(form.filename(), Some("my report.txt"));
        assert_eq!(clear_file_name("my report.txt"), "my_report.txt");
        assert_eq!(clear_file_name("a\tb c"), "a_b_c");
        assert_eq!(clear_file_name(""), "");
    }

    #[test]
    fn parts_iterates_all_segments_until_end_marker() {
        let body = "--B\r\nContent-Disposition: form-data; name=\"a\"\r\nContent-Type: text/plain\r\n\r\none\r\n--B\r\nContent-Disposition: form-data; name=\"b\"\r\nContent-Type: text/plain\r\n\r\ntwo\r\n--B--\r\n";
        let parts: Vec<FormPart> = FormData::parts(body, CONTENT_TYPE).collect();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.is_valid));
        assert_eq!(parts[0].disposition.get("name").unwrap(), "a");
        assert_eq!(parts[1].disposition.get("name").unwrap(), "b");
        assert!(parts[0].content.contains("one"));
        assert!(parts[1].content.contains("two"));
    }

    #[test]
    fn parts_on_unbounded_body_yields_nothing() {
        assert_eq!(FormData::parts("junk", CONTENT_TYPE).count(), 0);
        assert_eq!(FormData::parts(BODY, "text/plain").count(), 0);
    }

    #[test]
    fn invalid_segment_is_yielded_as_invalid() {
        let body = "--B\r\nContent-Disposition: form-data; nothere=\"a\"\r\nContent-Type: text/plain\r\n\r\none\r\n--B--\r\n";
        let parts: Vec<FormPart> = FormData::parts(body, CONTENT_TYPE).collect();
        assert_eq!(parts.len(), 1);
        assert!(!parts[0].is_valid);
    }
}
