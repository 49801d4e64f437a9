//! HTTP/1.1 request-head reading for the proxy listener.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest request head accepted, in bytes.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Method, target and the one header the proxy acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub proxy_authorization: Option<String>,
    /// Bytes read past the end of the head.
    pub remainder: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error("connection closed before a complete request head")]
    Closed,

    #[error("request head exceeds {MAX_HEAD_SIZE} bytes")]
    TooLarge,

    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("I/O error reading request head: {0}")]
    Io(#[from] io::Error),
}

impl HeadError {
    /// Whether the client should get a 400 rather than a silent close.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, HeadError::TooLarge | HeadError::Malformed(_))
    }
}

/// Read from `stream` until a complete request head has arrived.
pub async fn read_request_head<S>(stream: &mut S) -> Result<RequestHead, HeadError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HeadError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(head) = parse_request_head(&buf)? {
            return Ok(head);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HeadError::TooLarge);
        }
    }
}

/// Parse a buffered head. `Ok(None)` means more bytes are needed.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let len = match request.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };
    if len > MAX_HEAD_SIZE {
        return Err(HeadError::TooLarge);
    }

    let proxy_authorization = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("proxy-authorization"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(|v| v.trim().to_string());

    Ok(Some(RequestHead {
        method: request.method.unwrap_or_default().to_string(),
        target: request.path.unwrap_or_default().to_string(),
        proxy_authorization,
        remainder: buf[len..].to_vec(),
    }))
}

/// `/healthz` and `/health`, ignoring any query string.
pub fn is_health_path(target: &str) -> bool {
    let path = target.split('?').next().unwrap_or(target);
    matches!(path, "/healthz" | "/health")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_head() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\n\
                    Host: example.com:443\r\n\
                    Proxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n\r\n";
        let head = parse_request_head(raw).unwrap().unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
        assert_eq!(
            head.proxy_authorization.as_deref(),
            Some("Basic YWxpY2U6czNjcmV0")
        );
        assert!(head.remainder.is_empty());
    }

    #[test]
    fn test_header_name_is_case_insensitive() {
        let raw = b"CONNECT a:1 HTTP/1.1\r\nproxy-AUTHORIZATION: Basic x\r\n\r\n";
        let head = parse_request_head(raw).unwrap().unwrap();
        assert_eq!(head.proxy_authorization.as_deref(), Some("Basic x"));
    }

    #[test]
    fn test_partial_head_needs_more() {
        assert!(parse_request_head(b"CONNECT example.com:443 HTTP/1.1\r\nHost:")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_bytes_after_head_are_kept() {
        let raw = b"CONNECT a:1 HTTP/1.1\r\n\r\n\x16\x03\x01";
        let head = parse_request_head(raw).unwrap().unwrap();
        assert_eq!(head.remainder, b"\x16\x03\x01");
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = parse_request_head(b"\x00\x01garbage\r\n\r\n").unwrap_err();
        assert!(err.is_bad_request());
    }

    #[tokio::test]
    async fn test_read_head_across_chunks() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(b"CONNECT example.com:443 ").await.unwrap();
            client.write_all(b"HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
            client
        });
        let head = read_request_head(&mut server).await.unwrap();
        assert_eq!(head.target, "example.com:443");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_head_rejected() {
        let (mut client, mut server) = tokio::io::duplex(MAX_HEAD_SIZE * 2);
        let mut raw = b"CONNECT example.com:443 HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.extend(vec![b'a'; MAX_HEAD_SIZE + 10]);
        tokio::io::AsyncWriteExt::write_all(&mut client, &raw)
            .await
            .unwrap();
        let err = read_request_head(&mut server).await.unwrap_err();
        assert!(matches!(err, HeadError::TooLarge), "{err}");
    }

    #[tokio::test]
    async fn test_eof_before_head_is_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_request_head(&mut server).await.unwrap_err();
        assert!(matches!(err, HeadError::Closed));
        assert!(!err.is_bad_request());
    }

    #[test]
    fn test_health_paths() {
        assert!(is_health_path("/healthz"));
        assert!(is_health_path("/health"));
        assert!(is_health_path("/healthz?verbose=1"));
        assert!(!is_health_path("/"));
        assert!(!is_health_path("/healthzz"));
    }
}
