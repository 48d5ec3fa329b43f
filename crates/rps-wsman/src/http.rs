//! HTTP framing with digest authentication
//!
//! AMT's WS-Management endpoint is `POST /wsman` protected by HTTP
//! digest auth. Requests are framed here as raw HTTP/1.1 text so the
//! device-side client can replay them verbatim against AMT, and the raw
//! responses it sends back are parsed into status, headers and body.

use crate::error::{Result, WsmanError};
use md5::{Digest, Md5};
use rand::RngCore;
use std::fmt;

const WSMAN_PATH: &str = "/wsman";

/// Server-issued digest challenge from `WWW-Authenticate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    /// Parse a `Digest realm="..", nonce="..", qop="auth"` header value
    pub fn parse(header: &str) -> Result<Self> {
        let rest = header
            .trim()
            .strip_prefix("Digest")
            .ok_or_else(|| WsmanError::Challenge("not a digest challenge".to_string()))?;

        let mut realm = None;
        let mut nonce = None;
        let mut qop = None;
        let mut opaque = None;
        let mut stale = false;

        for (key, value) in split_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                // AMT offers "auth"; pick it out of a list like "auth,auth-int"
                "qop" => {
                    qop = value
                        .split(',')
                        .map(str::trim)
                        .find(|q| *q == "auth")
                        .map(str::to_string)
                }
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or_else(|| WsmanError::Challenge("missing realm".to_string()))?,
            nonce: nonce.ok_or_else(|| WsmanError::Challenge("missing nonce".to_string()))?,
            qop,
            opaque,
            stale,
        })
    }
}

/// Split `key="value", key=value` pairs, honouring commas inside quotes
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.trim().is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }

    pairs
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Digest response hash (RFC 2617)
fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<(&str, &str, &str)>,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    match qop {
        Some((qop, nc, cnonce)) => md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}")),
        None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
    }
}

/// Where and how to reach one device's AMT
#[derive(Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    challenge: Option<DigestChallenge>,
    nonce_count: u32,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            challenge: None,
            nonce_count: 0,
        }
    }

    pub fn challenge(&self) -> Option<&DigestChallenge> {
        self.challenge.as_ref()
    }

    /// Adopt a fresh challenge; the nonce count restarts with it
    pub fn set_challenge(&mut self, challenge: DigestChallenge) {
        self.challenge = Some(challenge);
        self.nonce_count = 0;
    }

    pub fn set_credentials(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.username = username.into();
        self.password = password.into();
    }

    /// `Authorization` header value for the next request, if a challenge is known
    fn authorization(&mut self, method: &str, uri: &str) -> Option<String> {
        let challenge = self.challenge.as_ref()?;
        self.nonce_count += 1;

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}""#,
            self.username, challenge.realm, challenge.nonce, uri
        );

        let response = match &challenge.qop {
            Some(qop) => {
                let nc = format!("{:08x}", self.nonce_count);
                let mut raw = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut raw);
                let cnonce = hex::encode(raw);
                let response = digest_response(
                    &self.username,
                    &challenge.realm,
                    &self.password,
                    method,
                    uri,
                    &challenge.nonce,
                    Some((qop.as_str(), nc.as_str(), cnonce.as_str())),
                );
                header.push_str(&format!(r#", qop={qop}, nc={nc}, cnonce="{cnonce}""#));
                response
            }
            None => digest_response(
                &self.username,
                &challenge.realm,
                &self.password,
                method,
                uri,
                &challenge.nonce,
                None,
            ),
        };

        header.push_str(&format!(r#", response="{response}""#));
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(r#", opaque="{opaque}""#));
        }
        Some(header)
    }

    /// Frame a request body as a raw `POST /wsman` HTTP request
    pub fn frame_request(&mut self, body: &str, content_type: &str) -> String {
        let mut request = format!(
            "POST {WSMAN_PATH} HTTP/1.1\r\nHost: {}:{}\r\n",
            self.host, self.port
        );
        if let Some(auth) = self.authorization("POST", WSMAN_PATH) {
            request.push_str(&format!("Authorization: {auth}\r\n"));
        }
        request.push_str(&format!(
            "Content-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ));
        request
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Raw HTTP response relayed from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| WsmanError::Http("missing header terminator".to_string()))?;
        let head = std::str::from_utf8(&raw[..split])
            .map_err(|_| WsmanError::Http("headers are not UTF-8".to_string()))?;
        let rest = &raw[split + 4..];

        let mut lines = head.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| WsmanError::Http("missing status line".to_string()))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(WsmanError::Http(format!("bad status line: {status_line}")));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| WsmanError::Http(format!("bad status code: {status_line}")))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let headers: Vec<(String, String)> = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        let mut response = Self {
            status,
            reason,
            headers,
            body: String::new(),
        };

        let body = if response
            .header("Transfer-Encoding")
            .is_some_and(|te| te.eq_ignore_ascii_case("chunked"))
        {
            decode_chunked(rest)?
        } else if let Some(len) = response.header("Content-Length").and_then(|l| l.parse::<usize>().ok()) {
            rest[..len.min(rest.len())].to_vec()
        } else {
            rest.to_vec()
        };

        response.body = String::from_utf8(body)
            .map_err(|_| WsmanError::Http("body is not UTF-8".to_string()))?;
        Ok(response)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn www_authenticate(&self) -> Option<&str> {
        self.header("WWW-Authenticate")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| WsmanError::Http("truncated chunk header".to_string()))?;
        let size_line = std::str::from_utf8(&data[..line_end])
            .map_err(|_| WsmanError::Http("chunk size is not UTF-8".to_string()))?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| WsmanError::Http(format!("bad chunk size: {size_hex}")))?;
        data = &data[line_end + 2..];

        if size == 0 {
            return Ok(out);
        }
        if data.len() < size {
            return Err(WsmanError::Http("truncated chunk".to_string()));
        }
        out.extend_from_slice(&data[..size]);
        data = data.get(size + 2..).unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &str = r#"Digest realm="Digest:A3829B3827DE4D33D4449B366831FD01", nonce="3GaBbXsAAAAAAAAAs6WS+HFfh6F7fmLC",stale="false",qop="auth""#;

    #[test]
    fn test_rfc2617_vector() {
        let response = digest_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some(("auth", "00000001", "0a4f113b")),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_parse_challenge() {
        let challenge = DigestChallenge::parse(CHALLENGE).unwrap();
        assert_eq!(challenge.realm, "Digest:A3829B3827DE4D33D4449B366831FD01");
        assert_eq!(challenge.nonce, "3GaBbXsAAAAAAAAAs6WS+HFfh6F7fmLC");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert!(!challenge.stale);

        let listed = DigestChallenge::parse(r#"Digest realm="r", nonce="n", qop="auth,auth-int""#).unwrap();
        assert_eq!(listed.qop.as_deref(), Some("auth"));

        assert!(DigestChallenge::parse("Basic realm=\"x\"").is_err());
        assert!(DigestChallenge::parse("Digest realm=\"x\"").is_err());
    }

    #[test]
    fn test_frame_request_without_and_with_challenge() {
        let mut params = ConnectionParams::new("localhost", 16992, "admin", "secret");
        let first = params.frame_request("{}", "application/json");
        assert!(first.starts_with("POST /wsman HTTP/1.1\r\n"));
        assert!(!first.contains("Authorization"));
        assert!(first.ends_with("Content-Length: 2\r\n\r\n{}"));

        params.set_challenge(DigestChallenge::parse(CHALLENGE).unwrap());
        let second = params.frame_request("{}", "application/json");
        assert!(second.contains(r#"Authorization: Digest username="admin""#));
        assert!(second.contains("nc=00000001"));
        let third = params.frame_request("{}", "application/json");
        assert!(third.contains("nc=00000002"));
    }

    #[test]
    fn test_debug_hides_password() {
        let params = ConnectionParams::new("localhost", 16992, "admin", "secret");
        assert!(!format!("{:?}", params).contains("secret"));
    }

    #[test]
    fn test_parse_response_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}trailing";
        let response = HttpResponse::parse(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "{}");
        assert!(response.is_success());
    }

    #[test]
    fn test_parse_response_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let response = HttpResponse::parse(raw).unwrap();
        assert_eq!(response.body, "Wikipedia");
    }

    #[test]
    fn test_parse_response_unauthorized() {
        let raw = format!(
            "HTTP/1.1 401 Unauthorized\r\nwww-authenticate: {CHALLENGE}\r\nContent-Length: 0\r\n\r\n"
        );
        let response = HttpResponse::parse(raw.as_bytes()).unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(response.www_authenticate(), Some(CHALLENGE));
    }

    #[test]
    fn test_parse_response_errors() {
        assert!(HttpResponse::parse(b"garbage").is_err());
        assert!(HttpResponse::parse(b"FTP 200 OK\r\n\r\n").is_err());
        assert!(HttpResponse::parse(b"HTTP/1.1 abc OK\r\n\r\n").is_err());
    }
}
