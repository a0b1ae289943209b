//! Reverse proxy to the internal gateway (HTTP + WebSocket).
//!
//! Every request is gated on [`Supervisor::ensure_running`]. Bodies are streamed in both
//! directions; nothing is buffered.

use axum::{
    body::Body,
    extract::{
        ws::{close_code, CloseFrame, Message as AxMsg, WebSocket, WebSocketUpgrade},
        FromRequestParts, Request,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    protocol::{frame::coding::CloseCode, CloseFrame as TungCloseFrame},
    Message as TungMsg,
};

use crate::config::ProxyTarget;
use crate::supervisor::{Supervisor, SupervisorError};

/// Proxied requests may run for minutes (agent turns).
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Where unconfigured traffic is sent.
pub const SETUP_PATH: &str = "/setup";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub struct ReverseProxy {
    client: reqwest::Client,
    supervisor: Supervisor,
    gateway: ProxyTarget,
    voice_webhook: ProxyTarget,
    token: String,
}

impl ReverseProxy {
    pub fn new(
        supervisor: Supervisor,
        gateway: ProxyTarget,
        voice_webhook: ProxyTarget,
        token: String,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROXY_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            supervisor,
            gateway,
            voice_webhook,
            token,
        })
    }

    /// Fallback handler body: redirect when unconfigured, else gate and forward.
    pub async fn handle(&self, req: Request) -> Response {
        if !self.supervisor.is_configured() {
            return redirect_to_setup();
        }
        if is_websocket_upgrade(req.headers()) {
            return self.upgrade(req).await;
        }
        if let Err(e) = self.supervisor.ensure_running().await {
            return gate_failure(&e);
        }
        self.forward(&self.gateway, req).await
    }

    /// Voice-call plugin webhook: raw body to the plugin's own port.
    pub async fn handle_voice_webhook(&self, req: Request) -> Response {
        if let Err(e) = self.supervisor.ensure_running().await {
            return gate_failure(&e);
        }
        self.forward(&self.voice_webhook, req).await
    }

    async fn forward(&self, target: &ProxyTarget, req: Request) -> Response {
        match self.try_forward(target, req).await {
            Ok(resp) => resp,
            Err(e) => {
                log::warn!("proxy to {} failed: {}", target, e);
                (StatusCode::BAD_GATEWAY, format!("Bad gateway: {}", e)).into_response()
            }
        }
    }

    async fn try_forward(&self, target: &ProxyTarget, req: Request) -> anyhow::Result<Response> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", target.http_base(), path_and_query);

        let mut headers = parts.headers;
        let original_host = headers.remove(header::HOST);
        strip_hop_by_hop(&mut headers);
        if let Some(host) = original_host {
            headers.insert("x-forwarded-host", host);
        }
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.token))?,
        );

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(h) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                h.append(name.clone(), value.clone());
            }
            strip_hop_by_hop(h);
        }
        Ok(builder.body(Body::from_stream(upstream.bytes_stream()))?)
    }

    async fn upgrade(&self, req: Request) -> Response {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let protocols: Vec<String> = req
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();

        let (mut parts, _body) = req.into_parts();
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws.protocols(protocols.clone()),
            Err(e) => return e.into_response(),
        };

        let gate = self.supervisor.ensure_running().await;
        let url = format!("{}{}", self.gateway.ws_base(), path_and_query);
        let token = self.token.clone();
        ws.on_upgrade(move |socket| async move {
            match gate {
                Ok(()) => {
                    if let Err(e) = splice_websocket(socket, &url, &token, &protocols).await {
                        log::warn!("websocket proxy to {} failed: {}", url, e);
                    }
                }
                Err(e) => {
                    log::warn!("closing websocket: {}", e);
                    close_unavailable(socket, &e).await;
                }
            }
        })
    }
}

fn redirect_to_setup() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, SETUP_PATH)]).into_response()
}

fn gate_failure(e: &SupervisorError) -> Response {
    match e {
        SupervisorError::NotConfigured(_) => redirect_to_setup(),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Gateway not ready: {}", e),
        )
            .into_response(),
    }
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

async fn close_unavailable(mut socket: WebSocket, e: &SupervisorError) {
    let mut reason = e.to_string();
    // Close reasons must fit in a control frame.
    reason.truncate(reason.char_indices().nth(120).map(|(i, _)| i).unwrap_or(reason.len()));
    let _ = socket
        .send(AxMsg::Close(Some(CloseFrame {
            code: close_code::AGAIN,
            reason: reason.into(),
        })))
        .await;
}

async fn splice_websocket(
    client: WebSocket,
    url: &str,
    token: &str,
    protocols: &[String],
) -> anyhow::Result<()> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token))?,
    );
    if !protocols.is_empty() {
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&protocols.join(", "))?,
        );
    }
    let (upstream, _) = tokio_tungstenite::connect_async(request).await?;

    let (mut up_sink, mut up_stream) = upstream.split();
    let (mut client_sink, mut client_stream) = client.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_stream.next().await {
            let closing = matches!(msg, AxMsg::Close(_));
            if up_sink.send(to_upstream(msg)).await.is_err() || closing {
                break;
            }
        }
        let _ = up_sink.close().await;
    };
    let upstream_to_client = async {
        while let Some(Ok(msg)) = up_stream.next().await {
            let Some(msg) = to_client(msg) else { continue };
            let closing = matches!(msg, AxMsg::Close(_));
            if client_sink.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = client_sink.close().await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
    Ok(())
}

fn to_upstream(msg: AxMsg) -> TungMsg {
    match msg {
        AxMsg::Text(t) => TungMsg::Text(t),
        AxMsg::Binary(b) => TungMsg::Binary(b),
        AxMsg::Ping(p) => TungMsg::Ping(p),
        AxMsg::Pong(p) => TungMsg::Pong(p),
        AxMsg::Close(frame) => TungMsg::Close(frame.map(|f| TungCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        })),
    }
}

fn to_client(msg: TungMsg) -> Option<AxMsg> {
    Some(match msg {
        TungMsg::Text(t) => AxMsg::Text(t),
        TungMsg::Binary(b) => AxMsg::Binary(b),
        TungMsg::Ping(p) => AxMsg::Ping(p),
        TungMsg::Pong(p) => AxMsg::Pong(p),
        TungMsg::Close(frame) => AxMsg::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason,
        })),
        TungMsg::Frame(_) => return None,
    })
}
