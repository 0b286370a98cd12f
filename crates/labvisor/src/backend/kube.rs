//! Minimal Kubernetes API client: JSON REST over reqwest plus the exec
//! streaming protocol over a WebSocket.

use std::time::Duration;

use futures::StreamExt;
use log::debug;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{BackendError, BackendResult, ExecOutput};
use crate::config::KubernetesConfig;

/// In-cluster service account token.
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Exec subprotocol: one leading channel byte per binary frame.
pub const EXEC_PROTOCOL: &str = "v4.channel.k8s.io";
pub const CHANNEL_STDIN: u8 = 0;
pub const CHANNEL_STDOUT: u8 = 1;
pub const CHANNEL_STDERR: u8 = 2;
pub const CHANNEL_STATUS: u8 = 3;

pub type ExecSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn from_config(config: &KubernetesConfig) -> BackendResult<Self> {
        let token_path = config
            .token_path
            .clone()
            .or_else(|| {
                std::path::Path::new(SERVICE_ACCOUNT_TOKEN)
                    .exists()
                    .then(|| SERVICE_ACCOUNT_TOKEN.to_string())
            });
        let token = match token_path {
            Some(path) => Some(std::fs::read_to_string(&path)?.trim().to_string()),
            None => None,
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> BackendResult<Value> {
        let res = self.authorize(req).send().await?;
        let status = res.status();
        let body: Value = res.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed"))
                .to_string();
            return Err(BackendError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }

    pub async fn get(&self, path: &str) -> BackendResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.http.get(url)).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> BackendResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.http.post(url).json(body)).await
    }

    pub async fn delete(&self, path: &str, grace_secs: Option<u64>) -> BackendResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.delete(url);
        if let Some(grace) = grace_secs {
            req = req.json(&serde_json::json!({
                "kind": "DeleteOptions",
                "apiVersion": "v1",
                "gracePeriodSeconds": grace,
            }));
        }
        self.send(req).await
    }

    /// WebSocket URL for `pods/{pod}/exec`.
    pub fn exec_url(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        tty: bool,
    ) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };

        let mut url = format!(
            "{}/api/v1/namespaces/{}/pods/{}/exec?container={}&stdout=true&stderr=true",
            ws_base,
            urlencoding::encode(namespace),
            urlencoding::encode(pod),
            urlencoding::encode(container),
        );
        if tty {
            url.push_str("&stdin=true&tty=true");
        }
        for arg in command {
            url.push_str("&command=");
            url.push_str(&urlencoding::encode(arg));
        }
        url
    }

    /// Open an exec stream into a pod container.
    pub async fn open_exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        tty: bool,
    ) -> BackendResult<ExecStream> {
        let url = self.exec_url(namespace, pod, container, command, tty);
        let mut request = url
            .into_client_request()
            .map_err(|e| BackendError::InvalidInput(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(EXEC_PROTOCOL),
        );
        if let Some(ref token) = self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| BackendError::InvalidInput(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        debug!("Opening exec stream into {}/{}", namespace, pod);
        let (socket, _response) = connect_async(request).await.map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Http(response) => BackendError::Http {
                status: response.status().as_u16(),
                message: "exec upgrade rejected".to_string(),
            },
            tokio_tungstenite::tungstenite::Error::Io(io) => {
                BackendError::Unavailable(io.to_string())
            }
            other => BackendError::Unavailable(other.to_string()),
        })?;

        Ok(ExecStream { socket })
    }
}

/// An open `v4.channel.k8s.io` exec stream.
pub struct ExecStream {
    socket: ExecSocket,
}

impl ExecStream {
    pub fn into_socket(self) -> ExecSocket {
        self.socket
    }

    /// Drain a non-interactive exec until the server closes it.
    pub async fn collect(mut self) -> BackendResult<ExecOutput> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0;

        while let Some(msg) = self.socket.next().await {
            let msg = msg.map_err(|e| BackendError::Unavailable(e.to_string()))?;
            let data = match msg {
                WsMessage::Binary(data) => data,
                WsMessage::Close(_) => break,
                _ => continue,
            };
            let Some((&channel, payload)) = data.split_first() else {
                continue;
            };
            match channel {
                CHANNEL_STDOUT => stdout.extend_from_slice(payload),
                CHANNEL_STDERR => stderr.extend_from_slice(payload),
                CHANNEL_STATUS => exit_code = parse_exit_status(payload),
                _ => {}
            }
        }
        let _ = self.socket.close(None).await;

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }
}

/// Build a stdin frame.
pub fn stdin_frame(data: &[u8]) -> WsMessage {
    let mut frame = Vec::with_capacity(data.len() + 1);
    frame.push(CHANNEL_STDIN);
    frame.extend_from_slice(data);
    WsMessage::Binary(frame.into())
}

/// Exit code from a status-channel `Status` object.
pub fn parse_exit_status(payload: &[u8]) -> i32 {
    let Ok(status) = serde_json::from_slice::<Value>(payload) else {
        return -1;
    };
    if status.get("status").and_then(Value::as_str) == Some("Success") {
        return 0;
    }
    status
        .pointer("/details/causes")
        .and_then(Value::as_array)
        .and_then(|causes| {
            causes.iter().find_map(|cause| {
                (cause.get("reason").and_then(Value::as_str) == Some("ExitCode"))
                    .then(|| cause.get("message").and_then(Value::as_str))
                    .flatten()
                    .and_then(|m| m.parse().ok())
            })
        })
        .unwrap_or(-1)
}
