// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Minimal HTTP/1.1 message framing for [`tokio_util::codec::Framed`].
//!
//! Only what the proxy protocol needs is supported: a start line, headers and
//! a `Content-Length` delimited body. The same codec frames requests and
//! responses.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// A request or response: start line, headers and body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpMessage {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpMessage {
    /// Builds a request message.
    pub fn request(method: &str, target: &str) -> Self {
        Self {
            start_line: format!("{} {} HTTP/1.1", method, target),
            ..Self::default()
        }
    }

    /// Builds a response message.
    pub fn response(status: u16, reason: &str) -> Self {
        Self {
            start_line: format!("HTTP/1.1 {} {}", status, reason),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns a header value; names compare case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parses the status code of a response start line.
    pub fn status(&self) -> Result<u16, TransportError> {
        let mut parts = self.start_line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(version), Some(code)) if version.starts_with("HTTP/") => code
                .parse()
                .map_err(|_| TransportError::protocol(format!("bad status line {:?}", self.start_line))),
            _ => Err(TransportError::protocol(format!(
                "bad status line {:?}",
                self.start_line
            ))),
        }
    }

    /// Splits a request start line into method and target.
    pub fn method_and_target(&self) -> Option<(&str, &str)> {
        let mut parts = self.start_line.split_whitespace();
        Some((parts.next()?, parts.next()?))
    }

    /// Returns true if the peer asked to close the connection.
    pub fn wants_close(&self) -> bool {
        self.header("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }
}

/// Codec for [`HttpMessage`].
#[derive(Debug, Default)]
pub struct HttpCodec {
    // Head parsed while waiting for the rest of the body.
    head: Option<(HttpMessage, usize)>,
}

impl HttpCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_head(head: &[u8]) -> Result<(HttpMessage, usize), TransportError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| TransportError::protocol("message head is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| TransportError::protocol("empty start line"))?
            .to_string();

        let mut headers = Vec::new();
        let mut content_length = 0usize;
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| TransportError::protocol(format!("malformed header {:?}", line)))?;
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value
                    .parse()
                    .map_err(|_| TransportError::protocol(format!("bad content-length {:?}", value)))?;
                if content_length > MAX_BODY_SIZE {
                    return Err(TransportError::protocol(format!(
                        "body of {} bytes exceeds limit",
                        content_length
                    )));
                }
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let message = HttpMessage {
            start_line,
            headers,
            body: Bytes::new(),
        };
        Ok((message, content_length))
    }
}

impl Decoder for HttpCodec {
    type Item = HttpMessage;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.head.is_none() {
            let Some(end) = src.windows(4).position(|w| w == b"\r\n\r\n") else {
                if src.len() > MAX_HEAD_SIZE {
                    return Err(TransportError::protocol("message head too large"));
                }
                return Ok(None);
            };
            let head = src.split_to(end + 4);
            self.head = Some(Self::parse_head(&head[..end])?);
        }

        let Some((_, content_length)) = self.head.as_ref() else {
            return Ok(None);
        };
        if src.len() < *content_length {
            src.reserve(*content_length - src.len());
            return Ok(None);
        }

        match self.head.take() {
            Some((mut message, content_length)) => {
                message.body = src.split_to(content_length).freeze();
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<HttpMessage> for HttpCodec {
    type Error = TransportError;

    fn encode(&mut self, item: HttpMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.start_line.len() + 64 * (item.headers.len() + 1) + item.body.len());
        dst.put_slice(item.start_line.as_bytes());
        dst.put_slice(b"\r\n");
        for (name, value) in &item.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if value.contains(['\r', '\n']) {
                return Err(TransportError::protocol(format!(
                    "header {:?} contains a line break",
                    name
                )));
            }
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(format!("Content-Length: {}\r\n\r\n", item.body.len()).as_bytes());
        dst.put_slice(&item.body);
        Ok(())
    }
}
