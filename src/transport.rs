//! Connection transports.
//!
//! The primary transport is a websocket carrying `~m~`-framed payloads.
//! A reader task decodes every envelope, acknowledges heartbeats, and
//! forwards structured messages over an mpsc channel; when the socket
//! closes for any reason a synthetic `session_ended` message ends the
//! stream so the consumer sees exactly one teardown signal. A handful of
//! operations are served over plain HTTP instead, with the response
//! normalized into the same message shape so correlation stays uniform.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ClientError;
use crate::frame::{self, FramePayload};
use crate::message::{Inbound, Outbound};

/// Operations served over plain HTTP rather than the socket.
pub const HTTP_APIS: &[&str] = &["room.directory_rooms", "user.get_prefs"];

/// Whether an operation goes over the HTTP fallback.
#[must_use]
pub fn uses_http(api: &str) -> bool {
    HTTP_APIS.contains(&api)
}

/// An open connection to the service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request frame.
    async fn publish(&self, message: &Outbound) -> Result<(), ClientError>;

    /// Close the connection. The inbound stream still terminates with its
    /// `session_ended` message.
    async fn close(&self);

    /// Whether the connection is currently usable.
    fn is_open(&self) -> bool;

    /// The url this transport is connected to.
    fn url(&self) -> &str;
}

/// Builds a transport for a url, delivering inbound messages to the given
/// channel. Injected so tests can substitute a scripted transport.
pub type TransportFactory = Arc<
    dyn Fn(String, mpsc::Sender<Inbound>) -> BoxFuture<'static, Result<Arc<dyn Transport>, ClientError>>
        + Send
        + Sync,
>;

/// The production factory: connect a [`WsTransport`].
#[must_use]
pub fn websocket_factory() -> TransportFactory {
    Arc::new(|url, inbound| {
        Box::pin(async move {
            let transport = WsTransport::connect(&url, inbound).await?;
            Ok(transport as Arc<dyn Transport>)
        })
    })
}

/// Websocket transport with the `~m~` framing.
pub struct WsTransport {
    url: String,
    writer: mpsc::Sender<Message>,
    open: Arc<AtomicBool>,
}

impl WsTransport {
    /// Connect and spawn the writer and reader tasks.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the websocket handshake fails.
    pub async fn connect(
        url: &str,
        inbound: mpsc::Sender<Inbound>,
    ) -> Result<Arc<Self>, ClientError> {
        let (stream, _) = connect_async(url).await.map_err(|err| {
            ClientError::Connection(format!("websocket connect to {url} failed: {err}"))
        })?;
        log::info!("Connected to {url}");
        let (mut sink, mut source) = stream.split();

        let (writer, mut writer_rx) = mpsc::channel::<Message>(64);
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(err) = sink.send(msg).await {
                    log::debug!("Websocket send failed: {err}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_writer = writer.clone();
        let reader_open = open.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        handle_text(&text, &reader_writer, &inbound).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        log::warn!("Websocket read failed: {err}");
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = inbound.send(Inbound::synthetic("session_ended")).await;
        });

        Ok(Arc::new(Self {
            url: url.to_string(),
            writer,
            open,
        }))
    }
}

async fn handle_text(text: &str, writer: &mpsc::Sender<Message>, inbound: &mpsc::Sender<Inbound>) {
    let payloads = match frame::decode(text) {
        Ok(payloads) => payloads,
        Err(err) => {
            log::warn!("Discarding malformed frame: {err}");
            return;
        }
    };

    for payload in payloads {
        log::trace!("Incoming payload: {payload}");
        match frame::classify(payload) {
            Ok(FramePayload::Heartbeat(counter)) => {
                let echo = frame::encode(&frame::heartbeat(&counter));
                let _ = writer.send(Message::Text(echo)).await;
                let _ = inbound.send(Inbound::synthetic("heartbeat")).await;
            }
            Ok(FramePayload::NoSession) => {
                let _ = inbound.send(Inbound::synthetic("no_session")).await;
            }
            Ok(FramePayload::Message(value)) => match Inbound::from_value(value) {
                Some(msg) => {
                    let _ = inbound.send(msg).await;
                }
                None => log::trace!("Ignoring message without a command: {payload}"),
            },
            Err(err) => log::warn!("Discarding unclassifiable payload: {err}"),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn publish(&self, message: &Outbound) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::Connection("connection is closed".to_string()));
        }
        log::debug!("Outgoing message: api={} msgid={}", message.api, message.msgid);
        let text = frame::encode(&message.to_value().to_string());
        self.writer
            .send(Message::Text(text))
            .await
            .map_err(|_| ClientError::Connection("connection is closed".to_string()))
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.writer.send(Message::Close(None)).await;
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Arm the per-request timeout. The timer always fires; the correlation
/// table guarantees only the first resolution of a msgid wins.
pub(crate) fn spawn_timeout(inbound: mpsc::Sender<Inbound>, msgid: u64, timeout: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let _ = inbound.send(Inbound::timeout(msgid)).await;
    });
}

/// Perform an HTTP fallback request, normalizing the `[success, data]`
/// response body (or any failure) into a correlated response message.
pub async fn http_fallback(http: &reqwest::Client, api_base: &str, message: &Outbound) -> Inbound {
    let url = format!("{}/{}", api_base.trim_end_matches('/'), message.api);
    let query: Vec<(String, String)> = message
        .to_value()
        .as_object()
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), query_value(v))).collect())
        .unwrap_or_default();

    let result: Result<Value, reqwest::Error> = async {
        let response = http.get(&url).query(&query).send().await?;
        response.json::<Value>().await
    }
    .await;

    match result {
        Ok(Value::Array(parts)) if !parts.is_empty() => {
            let success = parts[0].as_bool().unwrap_or(false);
            let data = parts.get(1).cloned().unwrap_or(Value::Null);
            let mut obj = serde_json::Map::new();
            obj.insert("msgid".to_string(), json!(message.msgid));
            obj.insert("success".to_string(), json!(success));
            match data {
                Value::Object(map) => obj.extend(map),
                Value::Null => {}
                other => {
                    obj.insert("data".to_string(), other);
                }
            }
            Inbound {
                command: "response_received".to_string(),
                data: Value::Object(obj),
            }
        }
        Ok(other) => {
            log::warn!("Unexpected body from {url}: {other}");
            failed_response(message.msgid, "malformed response body")
        }
        Err(err) => failed_response(message.msgid, &err.to_string()),
    }
}

fn failed_response(msgid: u64, err: &str) -> Inbound {
    Inbound {
        command: "response_received".to_string(),
        data: json!({ "msgid": msgid, "success": false, "err": err }),
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn outbound(api: &str, msgid: u64) -> Outbound {
        let mut params = Map::new();
        params.insert("section".to_string(), json!("rooms"));
        Outbound {
            api: api.to_string(),
            msgid,
            params,
        }
    }

    #[test]
    fn test_http_apis_lookup() {
        assert!(uses_http("room.directory_rooms"));
        assert!(uses_http("user.get_prefs"));
        assert!(!uses_http("room.register"));
    }

    #[tokio::test]
    async fn test_http_fallback_normalizes_success_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/room.directory_rooms"))
            .and(query_param("api", "room.directory_rooms"))
            .and(query_param("msgid", "7"))
            .and(query_param("section", "rooms"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([true, { "rooms": [["r1", 5]] }])),
            )
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let msg = http_fallback(&http, &server.uri(), &outbound("room.directory_rooms", 7)).await;

        assert_eq!(msg.command, "response_received");
        assert_eq!(msg.msgid(), Some(7));
        assert!(msg.success());
        assert!(msg.data.get("rooms").is_some());
    }

    #[tokio::test]
    async fn test_http_fallback_maps_failure_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user.get_prefs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([false, "no session"])))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let msg = http_fallback(&http, &server.uri(), &outbound("user.get_prefs", 3)).await;

        assert!(!msg.success());
        assert_eq!(msg.data.get("data"), Some(&json!("no session")));
    }

    #[tokio::test]
    async fn test_http_fallback_maps_transport_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let msg = http_fallback(&http, &server.uri(), &outbound("user.get_prefs", 4)).await;

        assert_eq!(msg.msgid(), Some(4));
        assert!(!msg.success());
        assert!(msg.error_text().is_some());
    }

    #[tokio::test]
    async fn test_websocket_heartbeat_echo_and_teardown_signal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(frame::encode("~h~7"))).await.unwrap();
            let echo = ws.next().await.unwrap().unwrap();
            assert_eq!(echo, Message::Text(frame::encode("~h~7")));
            ws.send(Message::Text(frame::encode(
                r#"{"command":"speak","userid":"u1","text":"hi"}"#,
            )))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        });

        let (tx, mut rx) = mpsc::channel(16);
        let transport = WsTransport::connect(&format!("ws://{addr}"), tx)
            .await
            .unwrap();
        assert!(transport.is_open());

        assert_eq!(rx.recv().await.unwrap().command, "heartbeat");
        assert_eq!(rx.recv().await.unwrap().command, "speak");
        assert_eq!(rx.recv().await.unwrap().command, "session_ended");
        assert!(!transport.is_open());
        server.await.unwrap();
    }
}
