//! Single-shot HTTP client built on Hyper's connection-level API.
//!
//! `https` URLs negotiate HTTP/2 or HTTP/1.1 over rustls; plain `http` URLs
//! (local gateways, test servers) speak HTTP/1.1 over TCP.

use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::TransportError;

/// Upper bound on waiting for the response head. Body frames are not timed.
const TIMEOUT_MS: u64 = 60_000;

type Result<T> = std::result::Result<T, TransportError>;

fn tls_connector() -> TlsConnector {
    let mut root_cert_store = RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    TlsConnector::from(Arc::new(config))
}

/// Sends `request` and waits for the response head.
pub(crate) async fn send(request: Request<String>) -> Result<Response<Incoming>> {
    let (host, port, secure) = endpoint(request.uri())?;

    tracing::debug!("connecting to {}:{}", host, port);
    let stream = TcpStream::connect((host.as_str(), port)).await?;

    let work = async {
        if secure {
            let tls_domain = ServerName::try_from(host.clone())
                .map_err(|_| TransportError::ServerName(host.clone()))?;
            let stream = tls_connector().connect(tls_domain, stream).await?;
            let http2 = stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
            exchange(stream, http2, request).await
        } else {
            exchange(stream, false, request).await
        }
    };

    match tokio::time::timeout(std::time::Duration::from_millis(TIMEOUT_MS), work).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Host to connect to, port, and whether TLS is used. IPv6 literals lose
/// their brackets so they resolve and validate as addresses.
fn endpoint(uri: &Uri) -> Result<(String, u16, bool)> {
    let host = uri
        .host()
        .ok_or_else(|| TransportError::ServerName(uri.to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(host)
        .to_owned();
    let secure = uri.scheme_str() == Some("https");
    let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
    Ok((host, port, secure))
}

async fn exchange<S>(
    stream: S,
    http2: bool,
    mut request: Request<String>,
) -> Result<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    if http2 {
        *request.version_mut() = Version::HTTP_2;
        let (mut sender, connection) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), io).await?;
        tokio::task::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("connection error: {}", e);
            }
            tracing::debug!("connection closed");
        });
        Ok(sender.send_request(request).await?)
    } else {
        into_origin_form(&mut request)?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;
        tokio::task::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("connection error: {}", e);
            }
            tracing::debug!("connection closed");
        });
        Ok(sender.send_request(request).await?)
    }
}

/// HTTP/1.1 wants a path-only target and an explicit `Host` header.
fn into_origin_form(request: &mut Request<String>) -> Result<()> {
    let uri = request.uri().clone();
    if let Some(authority) = uri.authority() {
        let host = HeaderValue::from_str(authority.as_str()).map_err(hyper::http::Error::from)?;
        request.headers_mut().insert(HOST, host);
    }
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .parse::<Uri>()
        .map_err(hyper::http::Error::from)?;
    *request.uri_mut() = path;
    *request.version_mut() = Version::HTTP_11;
    Ok(())
}

/// Turns a non-success response into [`TransportError::Status`], keeping the
/// body for the error message.
pub(crate) async fn ensure_success(response: Response<Incoming>) -> Result<Response<Incoming>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = read_body(response).await.unwrap_or_default();
    Err(TransportError::Status {
        status,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

pub(crate) async fn read_body(response: Response<Incoming>) -> Result<Vec<u8>> {
    Ok(response.into_body().collect().await?.to_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_hosts_lose_brackets() {
        let uri: Uri = "http://[::1]:8080/openai".parse().unwrap();
        assert_eq!(endpoint(&uri).unwrap(), ("::1".to_owned(), 8080, false));

        let uri: Uri = "https://[2001:db8::1]/openai".parse().unwrap();
        let (host, port, secure) = endpoint(&uri).unwrap();
        assert_eq!((host.as_str(), port, secure), ("2001:db8::1", 443, true));
        assert!(ServerName::try_from(host).is_ok());

        let uri: Uri = "https://gateway.example.com/openai".parse().unwrap();
        assert_eq!(
            endpoint(&uri).unwrap(),
            ("gateway.example.com".to_owned(), 443, true)
        );
    }

    #[test]
    fn origin_form_sets_host() {
        let mut request = Request::builder()
            .uri("http://127.0.0.1:8080/openai/chat?api-version=1")
            .body(String::new())
            .unwrap();
        into_origin_form(&mut request).unwrap();
        assert_eq!(request.uri(), "/openai/chat?api-version=1");
        assert_eq!(request.headers()[HOST], "127.0.0.1:8080");
        assert_eq!(request.version(), Version::HTTP_11);
    }
}
