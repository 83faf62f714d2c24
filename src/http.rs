use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};

const MAX_RESPONSE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUrl {
    pub scheme: Scheme,
    /// Without brackets for IPv6 literals.
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl HttpUrl {
    /// Accepts `http://` and `https://` URLs; a bare host means `http://`.
    pub fn parse(url: &str) -> Result<Self, HttpError> {
        let invalid = || HttpError::InvalidUrl(url.to_string());
        let url = url.trim();

        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => (Scheme::Http, rest),
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("https") => (Scheme::Https, rest),
            Some(_) => return Err(invalid()),
            None => (Scheme::Http, url),
        };

        let (authority, path) = match rest.find(['/', '?', '#']) {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let path = path.split('#').next().unwrap_or("/");
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
        let authority = authority.rsplit('@').next().unwrap_or(authority);

        let default_port = match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        };

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if after.is_empty() => default_port,
                None => return Err(invalid()),
            };
            (host.to_string(), port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host.to_string(), port.parse().map_err(|_| invalid())?),
                None => (authority.to_string(), default_port),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self { scheme, host, port, path })
    }

    fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match (self.scheme, self.port) {
            (Scheme::Http, 80) | (Scheme::Https, 443) => host,
            _ => format!("{}:{}", host, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One HTTP/1.1 exchange, over TLS for `https://`. Redirects are not followed.
pub async fn request(url: &HttpUrl, method: &str, limit: Duration) -> Result<HttpResponse, HttpError> {
    timeout(limit, exchange(url, method))
        .await
        .map_err(|_| HttpError::Timeout(limit))?
}

async fn exchange(url: &HttpUrl, method: &str) -> Result<HttpResponse, HttpError> {
    log::debug!("HTTP {} {}:{}{}", method, url.host, url.port, url.path);
    let stream = TcpStream::connect((url.host.as_str(), url.port)).await?;

    match url.scheme {
        Scheme::Http => send(stream, url, method).await,
        Scheme::Https => {
            let name = ServerName::try_from(url.host.clone()).map_err(|_| HttpError::InvalidUrl(url.host.clone()))?;
            let stream = tls_connector()?
                .connect(name, stream)
                .await
                .map_err(|e| HttpError::Tls(e.to_string()))?;
            send(stream, url, method).await
        }
    }
}

fn tls_connector() -> Result<TlsConnector, HttpError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn send<S>(mut stream: S, url: &HttpUrl, method: &str) -> Result<HttpResponse, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: ruknock/{}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        method,
        url.path,
        url.host_header(),
        env!("CARGO_PKG_VERSION"),
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    let mut header_end: Option<usize> = None;
    let mut expected_body_len: Option<usize> = None;

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            // TLS peers often close without close_notify once the body is out.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && header_end.is_some() => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);

        if header_end.is_none() {
            if let Some(pos) = response.windows(4).position(|w| w == b"\r\n\r\n") {
                header_end = Some(pos + 4);
                expected_body_len = if method.eq_ignore_ascii_case("HEAD") {
                    Some(0)
                } else {
                    content_length(&response[..pos])
                };
            }
        }

        if let (Some(end), Some(len)) = (header_end, expected_body_len) {
            if response.len() - end >= len {
                break;
            }
        }
        if response.len() > MAX_RESPONSE_SIZE {
            break;
        }
    }

    let end = header_end.ok_or_else(|| HttpError::Malformed("incomplete headers".to_string()))?;
    let status = parse_status(&response[..end])?;
    let mut body = response[end..].to_vec();
    if let Some(len) = expected_body_len {
        body.truncate(len);
    }
    Ok(HttpResponse { status, body })
}

fn content_length(headers: &[u8]) -> Option<usize> {
    let headers = std::str::from_utf8(headers).ok()?;
    headers.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn parse_status(headers: &[u8]) -> Result<u16, HttpError> {
    let text = String::from_utf8_lossy(headers);
    let status_line = text.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| HttpError::Malformed(status_line.to_string())),
        _ => Err(HttpError::Malformed(status_line.to_string())),
    }
}
