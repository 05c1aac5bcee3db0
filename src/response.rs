use std::collections::HashMap;

/// An HTTP response ready to be serialized and written to the socket.
#[derive(Debug)]
pub struct HttpResponse {
    status: u16,
    status_text: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, status_text: &str, body: &str) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "text/html".to_string());
        headers.insert("Content-Length".to_string(), body.len().to_string());

        HttpResponse {
            status,
            status_text: status_text.to_string(),
            headers,
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Full wire format: status line, headers, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut response = format!("HTTP/1.1 {} {}\r\n", self.status, self.status_text);
        for (key, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", key, value));
        }
        response.push_str("\r\n");

        let mut bytes = response.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn ok(body: &str) -> Self {
        HttpResponse::new(200, "OK", body)
    }

    pub fn bad_request() -> Self {
        HttpResponse::new(400, "Bad Request", &error_page(400, "Bad Request"))
    }

    pub fn not_found() -> Self {
        HttpResponse::new(404, "Not Found", &error_page(404, "Not Found"))
    }

    pub fn method_not_allowed() -> Self {
        HttpResponse::new(
            405,
            "Method Not Allowed",
            &error_page(405, "Method Not Allowed"),
        )
    }

    pub fn internal_error() -> Self {
        HttpResponse::new(
            500,
            "Internal Server Error",
            &error_page(500, "Internal Server Error"),
        )
    }
}

fn error_page(status: u16, title: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{status} {title}</title></head>\n\
         <body>\n<h1>{status}</h1>\n<p>{title}</p>\n<a href=\"/\">Go Home</a>\n</body>\n</html>",
        status = status,
        title = title
    )
}
