//! HTTP and websocket transport to the instance manager.
//!
//! Two endpoint flavors share one interface: the local daemon over its
//! Unix socket, and a remote daemon over HTTPS with a client certificate.
//! Websockets (exec streams) are upgraded over the same transports.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixConnector, Uri as UnixUri};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_tungstenite::{client_async, WebSocketStream};

use crate::errors::IncusError;

/// Raw response: status, ETag (when present), body bytes.
pub struct RawResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub body: Bytes,
}

/// Extra headers on a request (file push metadata).
pub type Headers<'a> = &'a [(&'a str, String)];

/// Byte stream a websocket can be layered over.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

/// Websocket connection to an operation stream.
pub type OpWebSocket = WebSocketStream<Box<dyn IoStream>>;

/// Certificate material for the HTTPS endpoint.
pub struct TlsIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    /// Expected server certificate; when set, any other presented
    /// certificate is rejected.
    pub server_cert_pem: Option<Vec<u8>>,
}

enum Endpoint {
    Unix {
        socket: PathBuf,
        client: HyperClient<UnixConnector, Full<Bytes>>,
    },
    Https {
        base: String,
        host: String,
        port: u16,
        client: reqwest::Client,
        tls: Arc<rustls::ClientConfig>,
    },
}

/// One transport handle; cheap to clone via `Arc` at the client layer.
pub struct Transport {
    endpoint: Endpoint,
}

impl Transport {
    /// Transport over the local daemon's Unix socket.
    pub fn unix(socket: impl Into<PathBuf>) -> Self {
        let client = HyperClient::builder(TokioExecutor::new()).build(UnixConnector);
        Self {
            endpoint: Endpoint::Unix {
                socket: socket.into(),
                client,
            },
        }
    }

    /// Transport over HTTPS with a client certificate.
    pub fn https(url: &str, identity: TlsIdentity) -> Result<Self, IncusError> {
        let base = url.trim_end_matches('/').to_string();
        let without_scheme = base
            .strip_prefix("https://")
            .ok_or_else(|| IncusError::Connect(format!("expected https:// URL, got {base}")))?;
        let (host, port) = match without_scheme.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|_| IncusError::Connect(format!("bad port in {base}")))?,
            ),
            None => (without_scheme.to_string(), 8443),
        };

        // One TLS config serves both REST calls and websocket upgrades,
        // so the pinned server certificate applies to all traffic.
        let tls = Arc::new(build_tls_config(&identity)?);
        let client = reqwest::Client::builder()
            .use_preconfigured_tls((*tls).clone())
            .build()
            .map_err(|e| IncusError::Connect(e.to_string()))?;

        Ok(Self {
            endpoint: Endpoint::Https {
                base,
                host,
                port,
                client,
                tls,
            },
        })
    }

    /// Issue a request and collect the whole response.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Bytes>,
        headers: Headers<'_>,
    ) -> Result<RawResponse, IncusError> {
        match &self.endpoint {
            Endpoint::Unix { socket, client } => {
                let uri: hyper::Uri = UnixUri::new(socket, path).into();
                let mut builder = http::Request::builder().method(method).uri(uri);
                for (name, value) in headers {
                    builder = builder.header(*name, value.as_str());
                }
                if body.is_some() {
                    builder = builder.header("content-type", "application/json");
                }
                let request = builder
                    .body(Full::new(body.unwrap_or_default()))
                    .map_err(|e| IncusError::Connect(e.to_string()))?;
                let response = client
                    .request(request)
                    .await
                    .map_err(|e| IncusError::Connect(e.to_string()))?;
                let status = response.status().as_u16();
                let etag = header_string(response.headers(), "etag");
                let body = response
                    .into_body()
                    .collect()
                    .await
                    .map_err(|e| IncusError::Decode(e.to_string()))?
                    .to_bytes();
                Ok(RawResponse { status, etag, body })
            }
            Endpoint::Https { base, client, .. } => {
                let url = format!("{base}{path}");
                let method = reqwest::Method::from_bytes(method.as_bytes())
                    .map_err(|e| IncusError::Connect(e.to_string()))?;
                let mut request = client.request(method, &url);
                for (name, value) in headers {
                    request = request.header(*name, value.as_str());
                }
                if let Some(body) = body {
                    request = request
                        .header("content-type", "application/json")
                        .body(body);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| IncusError::Connect(e.to_string()))?;
                let status = response.status().as_u16();
                let etag = header_string(response.headers(), "etag");
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| IncusError::Decode(e.to_string()))?;
                Ok(RawResponse { status, etag, body })
            }
        }
    }

    /// Upgrade a websocket on `path` (an operation stream).
    pub async fn websocket(&self, path: &str) -> Result<OpWebSocket, IncusError> {
        match &self.endpoint {
            Endpoint::Unix { socket, .. } => {
                let stream = UnixStream::connect(socket)
                    .await
                    .map_err(|e| IncusError::Connect(e.to_string()))?;
                let url = format!("ws://incus{path}");
                let boxed: Box<dyn IoStream> = Box::new(stream);
                let (ws, _) = client_async(url, boxed)
                    .await
                    .map_err(|e| IncusError::Websocket(e.to_string()))?;
                Ok(ws)
            }
            Endpoint::Https {
                host, port, tls, ..
            } => {
                let tcp = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| IncusError::Connect(e.to_string()))?;
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|e| IncusError::Connect(e.to_string()))?;
                let connector = tokio_rustls::TlsConnector::from(tls.clone());
                let stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| IncusError::Connect(e.to_string()))?;
                let url = format!("wss://{host}:{port}{path}");
                let boxed: Box<dyn IoStream> = Box::new(stream);
                let (ws, _) = client_async(url, boxed)
                    .await
                    .map_err(|e| IncusError::Websocket(e.to_string()))?;
                Ok(ws)
            }
        }
    }
}

fn header_string(headers: &http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// rustls client config with our identity and the pinned-or-any server
/// certificate policy (the daemon's certificate is self-signed).
fn build_tls_config(identity: &TlsIdentity) -> Result<rustls::ClientConfig, IncusError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut identity.cert_pem.as_slice())
            .collect::<Result<_, _>>()
            .map_err(|e| IncusError::Certificate(format!("client cert: {e}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut identity.key_pem.as_slice())
        .map_err(|e| IncusError::Certificate(format!("client key: {e}")))?
        .ok_or_else(|| IncusError::Certificate("no private key in key file".to_string()))?;

    let pinned = match &identity.server_cert_pem {
        Some(pem) => {
            let mut pem_slice = pem.as_slice();
            let mut iter = rustls_pemfile::certs(&mut pem_slice);
            Some(
                iter.next()
                    .ok_or_else(|| IncusError::Certificate("empty server cert file".to_string()))?
                    .map_err(|e| IncusError::Certificate(format!("server cert: {e}")))?,
            )
        }
        None => None,
    };

    let provider = rustls::crypto::ring::default_provider();
    let verifier = Arc::new(PinnedServerCert {
        pinned,
        provider: provider.clone(),
    });

    // Name the provider explicitly; the process may have more than one
    // crypto provider feature enabled through the dependency graph.
    rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| IncusError::Certificate(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)
        .map_err(|e| IncusError::Certificate(e.to_string()))
}

/// Accepts the pinned server certificate, or any certificate when none is
/// pinned. Signatures are still verified against the presented cert.
#[derive(Debug)]
struct PinnedServerCert {
    pinned: Option<CertificateDer<'static>>,
    provider: rustls::crypto::CryptoProvider,
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(pinned) = &self.pinned {
            if pinned.as_ref() != end_entity.as_ref() {
                return Err(rustls::Error::General(
                    "server certificate does not match the pinned certificate".to_string(),
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
