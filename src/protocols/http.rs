//! HTTP client and server drivers.
//!
//! The client issues one HTTP request per read command, built from the
//! command's request info; the server binds a per-device endpoint and hands
//! every request to the device's scripts, whose request info becomes the
//! HTTP response. TLS material (PEM, base64) arrives through URL options.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode as HttpStatus;
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Router;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, trace};

use crate::core::data::now_millis;
use crate::core::device::{Command, Device};
use crate::core::error::{GatewayError, Result};
use crate::core::util::unescape_bytes;
use crate::driver::command::{CommandRuntime, ExecContext};
use crate::driver::options::{ConnectionUrl, HttpOptions};
use crate::driver::protocol::{CommandOutcome, DeviceProtocol, DriverBuild, ProtocolDriver};
use crate::script::ScriptValue;

/// Request info accepted by the http-client driver.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct HttpRequestInfo {
    method: Option<String>,
    path: Option<String>,
    base_path: Option<String>,
    body: Option<String>,
    params: Option<HashMap<String, Vec<String>>>,
    headers: Option<HashMap<String, Vec<String>>>,
    proxy: Option<HashMap<String, String>>,
}

/// Response info produced by http-server scripts.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct HttpResponseInfo {
    http_status_code: Option<u16>,
    body: Option<String>,
    headers: Option<HashMap<String, Vec<String>>>,
}

fn headers_to_value(headers: &axum::http::HeaderMap) -> ScriptValue {
    let mut map = std::collections::BTreeMap::new();
    for name in headers.keys() {
        let values: Vec<ScriptValue> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| ScriptValue::Str(v.to_string()))
            .collect();
        map.insert(name.to_string(), ScriptValue::List(values));
    }
    ScriptValue::Dict(map)
}

// ============================================================================
// HTTP client
// ============================================================================

/// `http-client://host:port[/base]` driver. Read commands only; the whole
/// exchange happens inside one command invocation.
pub struct HttpClientDriver {
    base: String,
    options: HttpOptions,
}

impl HttpClientDriver {
    pub fn build(
        device: &mut Device,
        url: &ConnectionUrl,
        runtime: &CommandRuntime,
    ) -> Result<DriverBuild> {
        runtime.execute_protocol_script(device)?;
        device.connection_command = true;
        let options = HttpOptions::from_url(url)?;
        Ok(DriverBuild {
            driver: Box::new(Self {
                base: url.connection_info.clone(),
                options,
            }),
            connection_lost_on_exception: true,
        })
    }

    fn client(&self, info: &HttpRequestInfo, timeout: Duration) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = &info.proxy {
            if let (Some(host), Some(port)) = (proxy.get("host"), proxy.get("port")) {
                let scheme = proxy
                    .get("type")
                    .map(|t| t.to_ascii_lowercase())
                    .unwrap_or_else(|| "http".into());
                let mut p = reqwest::Proxy::all(format!("{scheme}://{host}:{port}"))
                    .map_err(|e| GatewayError::config(format!("invalid proxy: {e}")))?;
                if let (Some(user), Some(pass)) = (proxy.get("username"), proxy.get("password")) {
                    p = p.basic_auth(user, pass);
                }
                builder = builder.proxy(p);
            }
        }
        if let (Some(cert), Some(key)) = (&self.options.cert, &self.options.key) {
            let mut pem = key.clone();
            pem.extend_from_slice(cert);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| GatewayError::config(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        if let Some(trust) = &self.options.trust_cert {
            let ca = reqwest::Certificate::from_pem(trust)
                .map_err(|e| GatewayError::config(format!("invalid trust certificate: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        Ok(builder.build()?)
    }

    fn build_url(&self, info: &HttpRequestInfo) -> String {
        let base = info
            .base_path
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.base.clone());
        let base = if base.starts_with("http://") || base.starts_with("https://") {
            base
        } else if self.options.cert.is_some() || self.options.trust_cert.is_some() {
            format!("https://{base}")
        } else {
            format!("http://{base}")
        };
        let mut url = format!(
            "{}{}",
            base.trim_end_matches('/'),
            info.path.as_deref().unwrap_or("")
        );
        if let Some(params) = &info.params {
            let mut query = Vec::new();
            for (key, values) in params {
                for value in values {
                    query.push(format!("{key}={value}"));
                }
            }
            if !query.is_empty() {
                url.push('?');
                url.push_str(&query.join("&"));
            }
        }
        url
    }
}

#[async_trait]
impl ProtocolDriver for HttpClientDriver {
    async fn request_connect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] http client requestConnect ignored", proto.device_id);
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] http client requestDisconnect ignored", proto.device_id);
        Ok(())
    }

    async fn request_command(
        &self,
        proto: &Arc<DeviceProtocol>,
        command: &Command,
        request_info: Option<String>,
        _ctx: &ExecContext,
    ) -> Result<CommandOutcome> {
        if !command.command_type.is_read() {
            return Err(GatewayError::script(
                "http-client doesn't support write-command",
            ));
        }
        let raw = request_info.ok_or_else(|| {
            GatewayError::script(format!("cmdId={}, request-info is empty", command.id))
        })?;
        let info: HttpRequestInfo = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::script(format!("invalid http request-info: {e}")))?;

        let method = reqwest::Method::from_bytes(
            info.method.as_deref().unwrap_or("GET").as_bytes(),
        )
        .map_err(|_| GatewayError::script(format!("invalid http method: {:?}", info.method)))?;
        let url = self.build_url(&info);
        let timeout = Duration::from_millis(command.command_timeout);
        let client = self.client(&info, timeout)?;

        let mut request = client.request(method, &url);
        if let Some(headers) = &info.headers {
            for (name, values) in headers {
                for value in values {
                    request = request.header(name, value);
                }
            }
        }
        let body = info
            .body
            .as_deref()
            .and_then(unescape_bytes)
            .unwrap_or_default();
        let response = request.body(body).send().await?;
        let received_time = now_millis();
        let status = response.status().as_u16();
        let headers = {
            let mut map = std::collections::BTreeMap::new();
            for name in response.headers().keys() {
                let values: Vec<ScriptValue> = response
                    .headers()
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .map(|v| ScriptValue::Str(v.to_string()))
                    .collect();
                map.insert(name.to_string(), ScriptValue::List(values));
            }
            ScriptValue::Dict(map)
        };
        let bytes = response.bytes().await?;
        let body_value = if self.options.use_byte_array_body {
            ScriptValue::Bytes(bytes.to_vec())
        } else {
            ScriptValue::Str(String::from_utf8_lossy(&bytes).into_owned())
        };
        trace!("[{}] response received, status={}", proto.device_id, status);
        Ok(CommandOutcome::Received {
            values: vec![ScriptValue::Int(status as i64), body_value, headers],
            received_time,
        })
    }
}

// ============================================================================
// HTTP server
// ============================================================================

/// Collector for the response info produced by commands during one HTTP
/// dispatch; the last entry wins.
pub struct HttpResponseCollector {
    entries: StdMutex<Vec<String>>,
}

impl HttpResponseCollector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: StdMutex::new(Vec::new()),
        })
    }

    pub fn push(&self, request_info: String) {
        self.entries.lock().unwrap().push(request_info);
    }

    fn last(&self) -> Option<String> {
        self.entries.lock().unwrap().last().cloned()
    }
}

#[derive(Clone)]
struct ServerState {
    proto: Arc<DeviceProtocol>,
    protocol_fn: Option<String>,
    use_byte_array_body: bool,
}

/// `http-server://[host]:port` driver.
pub struct HttpServerDriver {
    host: String,
    port: u16,
    options: HttpOptions,
    protocol_fn: Option<String>,
    server: StdMutex<Option<JoinHandle<()>>>,
}

impl HttpServerDriver {
    pub fn build(
        device: &mut Device,
        url: &ConnectionUrl,
        runtime: &CommandRuntime,
    ) -> Result<DriverBuild> {
        runtime.compile_protocol_script(device)?;
        device.connection_command = false;
        let (host, port) = url.host_port()?;
        Ok(DriverBuild {
            driver: Box::new(Self {
                host: if host.is_empty() { "0.0.0.0".into() } else { host },
                port,
                options: HttpOptions::from_url(url)?,
                protocol_fn: runtime.protocol_fn(),
                server: StdMutex::new(None),
            }),
            connection_lost_on_exception: false,
        })
    }

    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        let (Some(cert), Some(key)) = (&self.options.cert, &self.options.key) else {
            return Ok(None);
        };
        use tokio_rustls::rustls;

        let certs = rustls_pemfile::certs(&mut cert.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| GatewayError::config(format!("invalid server certificate: {e}")))?;
        let key = rustls_pemfile::private_key(&mut key.as_slice())
            .map_err(|e| GatewayError::config(format!("invalid server key: {e}")))?
            .ok_or_else(|| GatewayError::config("no private key in key option"))?;

        let config = if let Some(trust) = &self.options.trust_cert {
            let mut roots = rustls::RootCertStore::empty();
            for ca in rustls_pemfile::certs(&mut trust.as_slice()) {
                let ca =
                    ca.map_err(|e| GatewayError::config(format!("invalid trust cert: {e}")))?;
                roots
                    .add(ca)
                    .map_err(|e| GatewayError::config(format!("invalid trust cert: {e}")))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| GatewayError::config(format!("client verifier failed: {e}")))?;
            rustls::ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        } else {
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
        }
        .map_err(|e| GatewayError::config(format!("tls config failed: {e}")))?;
        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

#[async_trait]
impl ProtocolDriver for HttpServerDriver {
    async fn request_connect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        info!(
            "[{}] host={}, port={}, socket-timeout={:?}",
            proto.device_id,
            self.host,
            self.port,
            proto.socket_timeout()
        );
        let state = ServerState {
            proto: proto.clone(),
            protocol_fn: self.protocol_fn.clone(),
            use_byte_array_body: self.options.use_byte_array_body,
        };
        let app = Router::new().fallback(handle_request).with_state(state);
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        let handle = match self.tls_acceptor()? {
            None => tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            }),
            Some(acceptor) => {
                let tls_listener = TlsListener { listener, acceptor };
                tokio::spawn(async move {
                    let _ = axum::serve(tls_listener, app).await;
                })
            }
        };
        if let Some(old) = self.server.lock().unwrap().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()> {
        trace!("[{}] start disconnect", proto.device_id);
        if let Some(server) = self.server.lock().unwrap().take() {
            server.abort();
        }
        Ok(())
    }

    async fn request_command(
        &self,
        _proto: &Arc<DeviceProtocol>,
        command: &Command,
        request_info: Option<String>,
        ctx: &ExecContext,
    ) -> Result<CommandOutcome> {
        if command.command_type.is_read() {
            return Err(GatewayError::script(
                "not supported command for http-server",
            ));
        }
        let collector = ctx
            .as_ref()
            .and_then(|any| any.clone().downcast::<HttpResponseCollector>().ok())
            .ok_or_else(|| {
                GatewayError::script("http-server only supports non-periodic commands")
            })?;
        if let Some(info) = request_info {
            collector.push(info);
        }
        Ok(CommandOutcome::NoResponse)
    }
}

async fn handle_request(State(state): State<ServerState>, req: Request) -> AxumResponse {
    let received_time = now_millis();
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, 16 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (HttpStatus::BAD_REQUEST, format!("invalid body: {e}")).into_response()
        }
    };

    let params = {
        let mut map: std::collections::BTreeMap<String, Vec<ScriptValue>> = Default::default();
        if let Some(query) = parts.uri.query() {
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                map.entry(key.to_string())
                    .or_default()
                    .push(ScriptValue::Str(value.to_string()));
            }
        }
        ScriptValue::Dict(
            map.into_iter()
                .map(|(k, v)| (k, ScriptValue::List(v)))
                .collect(),
        )
    };
    let body_value = if state.use_byte_array_body {
        ScriptValue::Bytes(bytes.to_vec())
    } else {
        ScriptValue::Str(String::from_utf8_lossy(&bytes).into_owned())
    };
    let values = vec![
        ScriptValue::Str(parts.method.to_string()),
        ScriptValue::Str(parts.uri.path().to_string()),
        body_value,
        params,
        headers_to_value(&parts.headers),
    ];

    let collector = HttpResponseCollector::new();
    let ctx: ExecContext = Some(collector.clone());
    let proto = &state.proto;
    let runtime = proto.runtime();

    let dispatch = async {
        match &state.protocol_fn {
            Some(fn_name) => {
                let result = runtime.call_fn_with_args(fn_name, None, &values, Some(received_time))?;
                match result {
                    ScriptValue::List(items) => {
                        let ids: Vec<String> = items.iter().map(|v| v.to_plain_string()).collect();
                        runtime
                            .execute_non_periodic_ids(
                                proto,
                                &ids,
                                Some(&values),
                                Some(received_time),
                                &ctx,
                            )
                            .await
                    }
                    other => {
                        error!(
                            "[{}] protocol function invalid output type, output type={}",
                            proto.device_id,
                            other.type_name()
                        );
                        Ok(())
                    }
                }
            }
            None => {
                runtime
                    .execute_non_periodic(proto, &values, received_time, &ctx)
                    .await
            }
        }
    };

    match dispatch.await {
        Err(e) => (HttpStatus::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Ok(()) => match collector.last() {
            None => HttpStatus::OK.into_response(),
            Some(raw) => {
                let info: HttpResponseInfo = match serde_json::from_str(&raw) {
                    Ok(info) => info,
                    Err(e) => {
                        return (
                            HttpStatus::INTERNAL_SERVER_ERROR,
                            format!("invalid response info: {e}"),
                        )
                            .into_response()
                    }
                };
                let status = HttpStatus::from_u16(info.http_status_code.unwrap_or(200))
                    .unwrap_or(HttpStatus::OK);
                let body = info
                    .body
                    .as_deref()
                    .and_then(unescape_bytes)
                    .unwrap_or_default();
                let mut response = AxumResponse::builder().status(status);
                if let Some(headers) = &info.headers {
                    for (name, values) in headers {
                        for value in values {
                            response = response.header(name, value);
                        }
                    }
                }
                response
                    .body(Body::from(body))
                    .unwrap_or_else(|_| HttpStatus::INTERNAL_SERVER_ERROR.into_response())
            }
        },
    }
}

/// TLS-terminating listener for [`axum::serve`].
struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl axum::serve::Listener for TlsListener {
    type Io = tokio_rustls::server::TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let Ok((stream, addr)) = self.listener.accept().await else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };
            match self.acceptor.accept(stream).await {
                Ok(tls) => return (tls, addr),
                Err(e) => trace!("tls handshake failed from {}: {}", addr, e),
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_info_parsing() {
        let info: HttpRequestInfo = serde_json::from_str(
            r#"{"method":"POST","path":"/data","body":"x=1","params":{"a":["1","2"]},"headers":{"X-Key":["v"]}}"#,
        )
        .unwrap();
        assert_eq!(info.method.as_deref(), Some("POST"));
        assert_eq!(info.params.unwrap()["a"].len(), 2);
    }

    #[test]
    fn test_response_info_defaults() {
        let info: HttpResponseInfo = serde_json::from_str("{}").unwrap();
        assert!(info.http_status_code.is_none());
        let info: HttpResponseInfo =
            serde_json::from_str(r#"{"httpStatusCode":404,"body":"missing"}"#).unwrap();
        assert_eq!(info.http_status_code, Some(404));
        assert_eq!(info.body.as_deref(), Some("missing"));
    }

    #[test]
    fn test_build_url() {
        let driver = HttpClientDriver {
            base: "example.com:8080".into(),
            options: HttpOptions::default(),
        };
        let info: HttpRequestInfo =
            serde_json::from_str(r#"{"path":"/api/v1","params":{"q":["x"]}}"#).unwrap();
        assert_eq!(driver.build_url(&info), "http://example.com:8080/api/v1?q=x");

        let info: HttpRequestInfo =
            serde_json::from_str(r#"{"basePath":"https://other:9090"}"#).unwrap();
        assert_eq!(driver.build_url(&info), "https://other:9090");
    }
}
