//! Client facade and session supervision.
//!
//! One `Client` owns one connection at a time. A driver task reads the
//! inbound message stream: responses resolve their pending correlation
//! right there, so a handler awaiting a nested call can never block its
//! own response, while push messages are transformed against the entity
//! scopes and forwarded to a dispatch task that runs handlers in order.
//!
//! Session lifecycle is event-driven, the same way the service models it:
//! the server answers a fresh socket with its "no session" signal, which
//! the built-in handler turns into authentication, the acquaintance list
//! load, initial presence, and a periodic presence refresh. Connection
//! loss surfaces as `session_ended`; when reconnection is enabled the
//! client retries with a fixed backoff (re-entering the previous room if
//! there was one) and announces success with a `reconnected` event.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::dispatch::{HandlerFn, Registry};
use crate::entity::{extract_id, Entity, EntityKind};
use crate::error::ClientError;
use crate::events::{self, EventKind, Payload};
use crate::message::{Inbound, Outbound};
use crate::scope::{RoomScope, Scopes};
use crate::transport::{self, Transport, TransportFactory};

/// Capacity of the inbound and dispatch channels.
const CHANNEL_CAPACITY: usize = 256;

struct Conn {
    transport: Arc<dyn Transport>,
    inbound_tx: mpsc::Sender<Inbound>,
    driver: JoinHandle<()>,
}

struct Shared {
    config: Config,
    client_id: String,
    coordinator: Coordinator,
    registry: Registry,
    scopes: Mutex<Scopes>,
    http: reqwest::Client,
    factory: TransportFactory,
    conn: Mutex<Option<Conn>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

/// Client for the real-time service. Cheap to clone; all clones share the
/// same connection, handlers, and entity scopes.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Build a client with the production websocket transport.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_transport_factory(config, transport::websocket_factory())
    }

    /// Build a client with a custom transport factory (used by tests to
    /// substitute a scripted transport).
    #[must_use]
    pub fn with_transport_factory(config: Config, factory: TransportFactory) -> Self {
        let client_id = format!(
            "{}-{}",
            chrono::Utc::now().timestamp(),
            rand::random::<f64>()
        );
        let scopes = Scopes::new(config.user_id.clone());
        let shared = Arc::new(Shared {
            config,
            client_id,
            coordinator: Coordinator::new(),
            registry: Registry::new(),
            scopes: Mutex::new(scopes),
            http: reqwest::Client::new(),
            factory,
            conn: Mutex::new(None),
            keepalive: Mutex::new(None),
            closing: AtomicBool::new(false),
        });
        let client = Self { shared };
        client.register_internal_handlers();
        client
    }

    /// The unique id identifying this client instance to the service.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.client_id
    }

    /// The authorized user's canonical entity.
    #[must_use]
    pub fn user(&self) -> Entity {
        self.shared.scopes.lock().expect("scopes lock poisoned").me()
    }

    /// The current room's entity, when the user is in one.
    #[must_use]
    pub fn room(&self) -> Option<Entity> {
        self.shared
            .scopes
            .lock()
            .expect("scopes lock poisoned")
            .room()
            .map(|scope| scope.room.clone())
    }

    /// Run a closure against the current room scope (role sets, current
    /// song and DJ).
    pub fn with_room_scope<R>(&self, f: impl FnOnce(&RoomScope) -> R) -> Option<R> {
        self.shared
            .scopes
            .lock()
            .expect("scopes lock poisoned")
            .room()
            .map(f)
    }

    /// Whether there is a live connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared
            .conn
            .lock()
            .expect("connection lock poisoned")
            .as_ref()
            .is_some_and(|conn| conn.transport.is_open())
    }

    /// The url currently connected to.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.shared
            .conn
            .lock()
            .expect("connection lock poisoned")
            .as_ref()
            .map(|conn| conn.transport.url().to_string())
    }

    /// Open a connection to the given chat url and wait until the server
    /// requests authentication. A no-op when already connected there.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the transport cannot be opened or the
    /// server never asks for a session.
    pub async fn connect(&self, url: &str) -> Result<(), ClientError> {
        if self.is_connected() && self.url().as_deref() == Some(url) {
            return Ok(());
        }
        self.close().await?;
        self.shared.closing.store(false, Ordering::SeqCst);

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let transport = (self.shared.factory)(url.to_string(), inbound_tx.clone()).await?;

        // Arm the session wait before the driver starts so the signal
        // cannot slip past, and record the connection before the driver
        // runs so the authentication handler can publish through it.
        let (session_id, session) = self.arm_wait(EventKind::SessionMissing, None);
        {
            let mut conn = self.shared.conn.lock().expect("connection lock poisoned");
            *conn = Some(Conn {
                transport,
                inbound_tx,
                driver: self.spawn_driver(inbound_rx),
            });
        }

        self.await_wait("session_missing", session_id, session).await?;
        Ok(())
    }

    /// Close the connection, if any, and wait for the teardown signal.
    /// Reconnection is suppressed for a close the caller asked for.
    ///
    /// # Errors
    ///
    /// Returns an error if the teardown signal never arrives.
    pub async fn close(&self) -> Result<(), ClientError> {
        let transport = self
            .shared
            .conn
            .lock()
            .expect("connection lock poisoned")
            .as_ref()
            .map(|conn| conn.transport.clone());
        let Some(transport) = transport else {
            return Ok(());
        };

        self.shared.closing.store(true, Ordering::SeqCst);
        let (ended_id, ended) = self.arm_wait(EventKind::SessionEnded, None);
        transport.close().await;
        let result = self.await_wait("session_ended", ended_id, ended).await;
        self.shared.closing.store(false, Ordering::SeqCst);
        result.map(|_| ())
    }

    /// Run a remote command and return its response data.
    ///
    /// Default credentials (`clientid`, `userid`, `userauth`) are merged
    /// into the parameters. The call suspends until the correlated
    /// response, its timeout, or connection closure resolves it.
    ///
    /// # Errors
    ///
    /// `Connection` when no connection is open or it closes mid-flight;
    /// `Remote` when the server reports a failure or the request times
    /// out; `Argument` when `params` is not a JSON object.
    pub async fn call(&self, command: &str, params: Value) -> Result<Value, ClientError> {
        let (transport, inbound_tx) = {
            let conn = self.shared.conn.lock().expect("connection lock poisoned");
            match conn.as_ref() {
                Some(conn) if conn.transport.is_open() => {
                    (conn.transport.clone(), conn.inbound_tx.clone())
                }
                _ => {
                    return Err(ClientError::Connection("connection is not open".to_string()))
                }
            }
        };

        let mut merged = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ClientError::Argument(format!(
                    "params must be a JSON object, got {other}"
                )))
            }
        };
        merged
            .entry("clientid".to_string())
            .or_insert_with(|| json!(self.shared.client_id));
        merged
            .entry("userid".to_string())
            .or_insert_with(|| json!(self.shared.config.user_id));
        merged
            .entry("userauth".to_string())
            .or_insert_with(|| json!(self.shared.config.auth_token));

        let msgid = self.shared.coordinator.next_msgid();
        let message = Outbound {
            api: command.to_string(),
            msgid,
            params: merged,
        };

        let response = self.shared.coordinator.register(msgid);
        transport::spawn_timeout(inbound_tx.clone(), msgid, self.shared.config.timeout);

        if transport::uses_http(command) {
            let http = self.shared.http.clone();
            let api_base = self.shared.config.api_base.clone();
            tokio::spawn(async move {
                let result = transport::http_fallback(&http, &api_base, &message).await;
                let _ = inbound_tx.send(result).await;
            });
        } else {
            transport.publish(&message).await?;
        }

        let data = response.await.map_err(|_| {
            ClientError::Connection("connection closed while waiting for response".to_string())
        })?;

        let msg = Inbound {
            command: "response_received".to_string(),
            data,
        };
        if msg.success() {
            Ok(msg.data)
        } else {
            Err(ClientError::Remote {
                command: command.to_string(),
                message: msg.error_text().unwrap_or("unknown error").to_string(),
            })
        }
    }

    /// Register a handler for an event.
    ///
    /// # Errors
    ///
    /// Returns an argument error for an unknown event name.
    pub fn on<F, Fut>(&self, event: &str, callback: F) -> Result<u64, ClientError>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        self.register(event, false, None, wrap(callback))
    }

    /// Register a handler that runs for the first matching message only.
    ///
    /// # Errors
    ///
    /// Returns an argument error for an unknown event name.
    pub fn once<F, Fut>(&self, event: &str, callback: F) -> Result<u64, ClientError>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        self.register(event, true, None, wrap(callback))
    }

    /// Register a handler that only runs when every key of `predicate`
    /// equals the corresponding field in the raw message data.
    ///
    /// # Errors
    ///
    /// Returns an argument error for an unknown event name or a
    /// non-object predicate.
    pub fn on_filtered<F, Fut>(
        &self,
        event: &str,
        predicate: Value,
        callback: F,
    ) -> Result<u64, ClientError>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        let Value::Object(predicate) = predicate else {
            return Err(ClientError::Argument(
                "predicate must be a JSON object".to_string(),
            ));
        };
        self.register(event, false, Some(predicate), wrap(callback))
    }

    /// Remove a previously registered handler.
    pub fn off(&self, handler_id: u64) -> bool {
        self.shared.registry.remove(handler_id)
    }

    /// Suspend until the event fires (with the same timeout discipline as
    /// `call`) and return its payload.
    ///
    /// # Errors
    ///
    /// `Argument` for an unknown event name; `Remote` on timeout;
    /// `Connection` if the client goes away first.
    pub async fn wait_for(
        &self,
        event: &str,
        predicate: Option<Map<String, Value>>,
    ) -> Result<Payload, ClientError> {
        let kind = known_event(event)?;
        let (id, rx) = self.arm_wait(kind, predicate);
        self.await_wait(event, id, rx).await
    }

    /// Enter a room: look up its chat host, connect there, register, and
    /// install the room state snapshot. Leaves any current room first.
    ///
    /// # Errors
    ///
    /// Returns the first failure from the lookup, connect, or register
    /// steps; a failed register leaves the client in no room.
    pub async fn enter_room(&self, room_id: &str) -> Result<Entity, ClientError> {
        let already_there = self
            .shared
            .scopes
            .lock()
            .expect("scopes lock poisoned")
            .room()
            .is_some_and(|scope| scope.room.id() == room_id);
        if already_there && self.is_connected() {
            let room = self.room();
            if let Some(room) = room {
                return Ok(room);
            }
        }

        if self.room().is_some() {
            self.leave_room().await?;
        }

        let url = self.chat_url(room_id).await?;
        self.connect(&url).await?;

        {
            let mut scopes = self.shared.scopes.lock().expect("scopes lock poisoned");
            scopes.set_room(Some(RoomScope::new(room_id)));
        }
        let registered = self
            .call("room.register", json!({ "roomid": room_id, "section": Value::Null }))
            .await;
        if let Err(err) = registered {
            let mut scopes = self.shared.scopes.lock().expect("scopes lock poisoned");
            scopes.set_room(None);
            return Err(err);
        }

        let info = self
            .call("room.info", json!({ "roomid": room_id, "extended": true }))
            .await?;
        let room_data = info.get("room").cloned().unwrap_or(Value::Null);
        let users = info
            .get("users")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        {
            let mut scopes = self.shared.scopes.lock().expect("scopes lock poisoned");
            if let Some(scope) = scopes.room_mut() {
                scope.install_snapshot(&room_data, &users);
            }
        }

        self.room()
            .ok_or_else(|| ClientError::Connection("room scope lost during entry".to_string()))
    }

    /// Leave the current room. A no-op when not in one.
    ///
    /// # Errors
    ///
    /// Returns the failure of the deregister command.
    pub async fn leave_room(&self) -> Result<(), ClientError> {
        let Some(room) = self.room() else {
            return Ok(());
        };
        self.call("room.deregister", json!({ "roomid": room.id() }))
            .await?;
        let mut scopes = self.shared.scopes.lock().expect("scopes lock poisoned");
        scopes.set_room(None);
        Ok(())
    }

    /// Search for songs. Issues the search and suspends until the service
    /// pushes the result set (or a failure) for this query.
    ///
    /// # Errors
    ///
    /// `Remote` when the search fails or no result arrives in time.
    pub async fn search_songs(&self, query: &str) -> Result<Vec<Entity>, ClientError> {
        if self.room().is_none() {
            return Err(ClientError::Argument(
                "must be in a room to search for songs".to_string(),
            ));
        }

        let mut predicate = Map::new();
        predicate.insert("query".to_string(), json!(query));
        let (done_id, completed) = self.arm_wait(EventKind::SearchCompleted, Some(predicate.clone()));
        let (failed_id, failed) = self.arm_wait(EventKind::SearchFailed, Some(predicate));

        if let Err(err) = self.call("file.search", json!({ "query": query })).await {
            self.shared.registry.remove(done_id);
            self.shared.registry.remove(failed_id);
            return Err(err);
        }

        // Whichever wait loses stays armed otherwise; remove it explicitly.
        let outcome = tokio::select! {
            done = self.await_wait("search_completed", done_id, completed) => {
                self.shared.registry.remove(failed_id);
                done?
            }
            failed = self.await_wait("search_failed", failed_id, failed) => {
                self.shared.registry.remove(done_id);
                failed?;
                return Err(ClientError::Remote {
                    command: "file.search".to_string(),
                    message: "search failed to complete".to_string(),
                });
            }
        };
        match outcome {
            Payload::Songs(songs) => Ok(songs),
            other => {
                log::warn!("Unexpected search payload: {other:?}");
                Ok(Vec::new())
            }
        }
    }

    /// List rooms from the directory (served over the HTTP fallback).
    ///
    /// # Errors
    ///
    /// Returns the failure of the directory command.
    pub async fn list_rooms(&self, section: &str) -> Result<Vec<Entity>, ClientError> {
        let data = self
            .call("room.directory_rooms", json!({ "section": section }))
            .await?;
        let rooms = data
            .get("rooms")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(room_from_entry).collect())
            .unwrap_or_default();
        Ok(rooms)
    }

    fn register(
        &self,
        event: &str,
        once: bool,
        predicate: Option<Map<String, Value>>,
        callback: HandlerFn,
    ) -> Result<u64, ClientError> {
        let kind = known_event(event)?;
        Ok(self.shared.registry.add(kind, once, predicate, callback))
    }

    fn arm_wait(
        &self,
        kind: EventKind,
        predicate: Option<Map<String, Value>>,
    ) -> (u64, oneshot::Receiver<Payload>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let id = self.shared.registry.add(
            kind,
            true,
            predicate,
            Arc::new(move |payload| {
                let slot = slot.clone();
                Box::pin(async move {
                    if let Some(tx) = slot.lock().expect("wait slot lock poisoned").take() {
                        let _ = tx.send(payload);
                    }
                    Ok(())
                })
            }),
        );
        (id, rx)
    }

    /// Await an armed one-shot. On failure the registration did not get
    /// consumed by dispatch, so it is removed here rather than left to
    /// fire on some later matching message.
    async fn await_wait(
        &self,
        event: &str,
        id: u64,
        rx: oneshot::Receiver<Payload>,
    ) -> Result<Payload, ClientError> {
        let result = match tokio::time::timeout(self.shared.config.timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ClientError::Connection(
                "connection closed while waiting".to_string(),
            )),
            Err(_) => Err(ClientError::Remote {
                command: event.to_string(),
                message: "request timed out".to_string(),
            }),
        };
        if result.is_err() {
            self.shared.registry.remove(id);
        }
        result
    }

    /// Driver task: resolve correlated responses immediately, transform
    /// everything else against the scopes, and hand the firings to the
    /// dispatch task. Ends on the teardown signal.
    fn spawn_driver(&self, mut inbound: mpsc::Receiver<Inbound>) -> JoinHandle<()> {
        // Weak like every other long-lived task: a client dropped without
        // `close()` must not be kept alive by its own connection loop.
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let (fire_tx, mut fire_rx) = mpsc::channel::<events::Firing>(CHANNEL_CAPACITY);
            let dispatch_weak = weak.clone();
            let dispatcher = tokio::spawn(async move {
                while let Some(firing) = fire_rx.recv().await {
                    let Some(shared) = dispatch_weak.upgrade() else {
                        break;
                    };
                    shared.registry.dispatch(&firing).await;
                }
            });

            while let Some(msg) = inbound.recv().await {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if let Some(msgid) = msg.msgid() {
                    if shared.coordinator.resolve(msgid, msg.data.clone()) {
                        continue;
                    }
                }

                if msg.command == "killdashnine" {
                    handle_end_request(&shared, &msg);
                }

                let ended = msg.command == "session_ended";
                let firings = {
                    let mut scopes = shared.scopes.lock().expect("scopes lock poisoned");
                    events::transform(&mut scopes, &msg)
                };
                for firing in firings {
                    if fire_tx.send(firing).await.is_err() {
                        return;
                    }
                }
                if ended {
                    break;
                }
            }

            drop(fire_tx);
            let _ = dispatcher.await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            shared.coordinator.fail_all();
            on_session_ended(shared);
        })
    }

    fn register_internal_handlers(&self) {
        let weak = Arc::downgrade(&self.shared);

        self.shared.registry.add(
            EventKind::Heartbeat,
            false,
            None,
            internal(weak.clone(), |client| async move {
                client.refresh_presence().await
            }),
        );

        self.shared.registry.add(
            EventKind::SessionMissing,
            false,
            None,
            internal(weak, |client| async move {
                client.establish_session().await
            }),
        );
    }

    /// Authenticate the configured user, load who they are a fan of, and
    /// start the periodic presence refresh.
    async fn establish_session(&self) -> Result<(), ClientError> {
        self.call("user.authenticate", json!({})).await?;

        let fan_of = self.call("user.get_fan_of", json!({})).await?;
        if let Some(ids) = fan_of.get("fanof").and_then(Value::as_array) {
            let mut scopes = self.shared.scopes.lock().expect("scopes lock poisoned");
            for id in ids.iter().filter_map(Value::as_str) {
                scopes.add_acquaintance(id);
            }
        }

        self.refresh_presence().await?;
        self.reset_keepalive();
        Ok(())
    }

    async fn refresh_presence(&self) -> Result<(), ClientError> {
        let status = self
            .user()
            .get("status")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "available".to_string());
        self.call("presence.update", json!({ "status": status }))
            .await?;
        Ok(())
    }

    fn reset_keepalive(&self) {
        // Hold the shared state weakly so a dropped client ends the task
        // instead of being kept alive by it.
        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.config.keepalive_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let client = Client { shared };
                if let Err(err) = client.refresh_presence().await {
                    log::debug!("Presence refresh failed: {err}");
                }
            }
        });
        let mut keepalive = self.shared.keepalive.lock().expect("keepalive lock poisoned");
        if let Some(previous) = keepalive.replace(task) {
            previous.abort();
        }
    }
}

/// The server asked this client to disconnect ("logged in elsewhere").
/// Honored when the request names no room or names the current one; never
/// followed by a reconnect.
fn handle_end_request(shared: &Arc<Shared>, msg: &Inbound) {
    let requested_room = msg.data.get("roomid").and_then(Value::as_str);
    let applies = match requested_room {
        None => true,
        Some(id) => shared
            .scopes
            .lock()
            .expect("scopes lock poisoned")
            .room()
            .is_some_and(|scope| scope.room.id() == id),
    };
    if !applies {
        return;
    }

    log::info!("Disconnect requested by the service");
    shared.closing.store(true, Ordering::SeqCst);
    let transport = shared
        .conn
        .lock()
        .expect("connection lock poisoned")
        .as_ref()
        .map(|conn| conn.transport.clone());
    if let Some(transport) = transport {
        tokio::spawn(async move {
            transport.close().await;
        });
    }
}

/// Teardown after the driver loop ends: cancel the keepalive, forget the
/// connection, and either stop (deliberate close, or reconnection is
/// disabled) or retry the previous room / endpoint indefinitely.
fn on_session_ended(shared: Arc<Shared>) {
    if let Some(task) = shared
        .keepalive
        .lock()
        .expect("keepalive lock poisoned")
        .take()
    {
        task.abort();
    }

    let previous = shared.conn.lock().expect("connection lock poisoned").take();
    let url = previous.map(|conn| conn.transport.url().to_string());

    let room_id = {
        let mut scopes = shared.scopes.lock().expect("scopes lock poisoned");
        let id = scopes.room().map(|scope| scope.room.id().to_string());
        scopes.set_room(None);
        id
    };

    if shared.closing.load(Ordering::SeqCst) || !shared.config.reconnect {
        return;
    }
    let Some(url) = url else {
        return;
    };

    let wait = shared.config.reconnect_wait;
    let weak = Arc::downgrade(&shared);
    drop(shared);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(wait).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let client = Client { shared };
            log::debug!("Attempting to reconnect");
            let result = match &room_id {
                Some(id) => client.enter_room(id).await.map(|_| ()),
                None => client.connect(&url).await,
            };
            match result {
                Ok(()) => {
                    client.announce_reconnected().await;
                    return;
                }
                Err(err) => log::debug!("Connection failed: {err}"),
            }
        }
    });
}

impl Client {
    /// Look up the chat host for a room over HTTP and build its socket url.
    async fn chat_url(&self, room_id: &str) -> Result<String, ClientError> {
        let url = format!(
            "{}/room.which_chatserver",
            self.shared.config.api_base.trim_end_matches('/')
        );
        let body: Value = self
            .shared
            .http
            .get(&url)
            .query(&[("roomid", room_id)])
            .send()
            .await
            .map_err(|err| ClientError::Connection(format!("chat host lookup failed: {err}")))?
            .json()
            .await
            .map_err(|err| ClientError::Connection(format!("chat host lookup failed: {err}")))?;

        let host = body
            .get(1)
            .and_then(|data| data.get("chatserver"))
            .and_then(|cs| cs.get(0))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ClientError::Connection(format!("malformed chat host lookup response: {body}"))
            })?;
        Ok(format!("ws://{host}/socket.io/websocket"))
    }

    /// Inject the reconnected announcement through the fresh connection so
    /// it dispatches in order with its messages.
    async fn announce_reconnected(&self) {
        let tx = self
            .shared
            .conn
            .lock()
            .expect("connection lock poisoned")
            .as_ref()
            .map(|conn| conn.inbound_tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(Inbound::synthetic("reconnected")).await;
        }
    }
}

fn known_event(event: &str) -> Result<EventKind, ClientError> {
    EventKind::from_name(event)
        .ok_or_else(|| ClientError::Argument(format!("unknown event {event:?}")))
}

fn wrap<F, Fut>(callback: F) -> HandlerFn
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(callback(payload)))
}

fn internal<F, Fut>(weak: Weak<Shared>, f: F) -> HandlerFn
where
    F: Fn(Client) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
{
    Arc::new(move |_payload| match weak.upgrade() {
        Some(shared) => Box::pin(f(Client { shared })),
        None => Box::pin(async { Ok(()) }),
    })
}

fn room_from_entry(entry: &Value) -> Option<Entity> {
    // Directory entries are either the room object or a [room, count] pair.
    let attrs = match entry {
        Value::Array(pair) => pair.first()?,
        other => other,
    };
    let id = extract_id(EntityKind::Room, attrs)?;
    let room = Entity::new(EntityKind::Room, id);
    room.apply(attrs);
    Some(room)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unknown_event_name_is_an_argument_error() {
        let client = Client::new(Config::new("u1", "token"));
        let result = client.on("no_such_event", |_| async { Ok(()) });
        assert!(matches!(result, Err(ClientError::Argument(_))));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = Client::new(Config::new("u1", "token"));
        let b = Client::new(Config::new("u1", "token"));
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_call_without_connection_fails_fast() {
        let client = Client::new(Config::new("u1", "token"));
        let err = client.call("room.register", json!({})).await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_timed_out_wait_is_unregistered() {
        let mut config = Config::new("u1", "token");
        config.timeout = Duration::from_millis(30);
        let client = Client::new(config);

        let err = client.wait_for("search_failed", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Remote { .. }));
        assert_eq!(client.shared.registry.count(EventKind::SearchFailed), 0);
    }

    /// Answers every publish with a bare success response.
    struct EchoTransport {
        url: String,
        inbound: mpsc::Sender<Inbound>,
    }

    #[async_trait::async_trait]
    impl Transport for EchoTransport {
        async fn publish(&self, message: &Outbound) -> Result<(), ClientError> {
            let response = json!({ "msgid": message.msgid, "success": true });
            let _ = self
                .inbound
                .send(Inbound::from_value(response).unwrap())
                .await;
            Ok(())
        }

        async fn close(&self) {
            let _ = self.inbound.send(Inbound::synthetic("session_ended")).await;
        }

        fn is_open(&self) -> bool {
            true
        }

        fn url(&self) -> &str {
            &self.url
        }
    }

    #[tokio::test]
    async fn test_resolved_search_leaves_no_armed_waits() {
        let client = Client::new(Config::new("u1", "token"));
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        {
            let mut conn = client.shared.conn.lock().unwrap();
            *conn = Some(Conn {
                transport: Arc::new(EchoTransport {
                    url: "ws://test".to_string(),
                    inbound: inbound_tx.clone(),
                }),
                inbound_tx: inbound_tx.clone(),
                driver: client.spawn_driver(inbound_rx),
            });
        }
        client
            .shared
            .scopes
            .lock()
            .unwrap()
            .set_room(Some(RoomScope::new("r1")));

        let search = {
            let client = client.clone();
            tokio::spawn(async move { client.search_songs("q").await })
        };
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.shared.registry.count(EventKind::SearchFailed) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let results = Inbound::from_value(json!({
            "command": "search_complete",
            "query": "q",
            "docs": []
        }))
        .unwrap();
        inbound_tx.send(results).await.unwrap();

        assert!(search.await.unwrap().unwrap().is_empty());
        // Both one-shots are gone: the winner was consumed by dispatch and
        // the failure wait was removed when the search resolved.
        assert_eq!(client.shared.registry.count(EventKind::SearchCompleted), 0);
        assert_eq!(client.shared.registry.count(EventKind::SearchFailed), 0);
    }
}
