//! HTTP heads and multipart parts as spoken on the `/stream` connection.

use std::collections::HashMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

const MAX_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

/// Header names are lower-cased
pub type HeaderMap = HashMap<String, String>;

#[derive(Debug)]
pub struct HttpHead {
    pub status: u16,
    pub headers: HeaderMap,
}

impl HttpHead {
    pub fn content_length(&self) -> Option<usize> {
        content_length(&self.headers)
    }
}

/// One part of the device's multipart stream
#[derive(Debug)]
pub struct Part {
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

pub fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers.get("content-length").and_then(|v| v.trim().parse().ok())
}

/// Reads one line without its line ending; `None` at EOF.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, line: &mut Vec<u8>) -> Result<Option<()>> {
    line.clear();
    let n = (&mut *reader).take(MAX_LINE as u64).read_until(b'\n', line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') && n == MAX_LINE {
        return Err(Error::Protocol("header line too long".into()));
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    Ok(Some(()))
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let mut line = Vec::new();
    loop {
        if read_line(reader, &mut line).await?.is_none() {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(Error::Protocol("too many headers".into()));
        }
        let text = String::from_utf8_lossy(&line);
        if let Some((name, value)) = text.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
}

/// Reads a status line and headers.
pub async fn read_http_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HttpHead> {
    let mut line = Vec::new();
    // tolerate blank lines left over from a previous body
    loop {
        if read_line(reader, &mut line).await?.is_none() {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        if !line.is_empty() {
            break;
        }
    }
    let status_line = String::from_utf8_lossy(&line).into_owned();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::Protocol(format!("bad status line: {status_line:?}")))?;
    let headers = read_headers(reader).await?;
    Ok(HttpHead { status, headers })
}

/// Reads and discards `len` bytes of a body.
pub async fn skip_body<R: AsyncBufRead + Unpin>(reader: &mut R, len: usize) -> Result<()> {
    let copied = tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink()).await?;
    if (copied as usize) < len {
        return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}

fn is_delimiter(line: &[u8], boundary: &str) -> bool {
    let b = boundary.as_bytes();
    line == b || (line.len() == b.len() + 2 && line.starts_with(b"--") && &line[2..] == b)
}

/// Reads the next part of a multipart stream; `None` once the peer closes.
pub async fn read_part<R: AsyncBufRead + Unpin>(reader: &mut R, boundary: &str) -> Result<Option<Part>> {
    let mut line = Vec::new();
    loop {
        if read_line(reader, &mut line).await?.is_none() {
            return Ok(None);
        }
        if is_delimiter(&line, boundary) {
            break;
        }
        if !line.is_empty() {
            tracing::trace!(bytes = line.len(), "skipping data outside a part");
        }
    }

    let headers = read_headers(reader).await?;
    let len = match content_length(&headers) {
        Some(len) => len,
        None => {
            tracing::warn!("part without Content-Length, treating as empty");
            0
        }
    };
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Part { headers, body }))
}

/// `POST /stream` request head
pub fn request_head(headers: &[(&str, String)]) -> Vec<u8> {
    let mut out = format!("POST {} HTTP/1.1\r\n", crate::constants::STREAM_PATH);
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// One part of the client's multipart stream
pub fn encode_part(boundary: &str, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("--{boundary}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    let mut out = out.into_bytes();
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
    out
}
