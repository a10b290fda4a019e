pub mod protocol;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use rand::Rng;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::auth::TokenSource;
use crate::fields::push_field_path;
use crate::mapper::{coerce_push_value, MappingError, StateMapper};

use protocol::{HubMessage, NegotiateResponse, ProductUpdate, TARGET_PRODUCT_UPDATE};

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// Upper bound of the random extra delay, as a share of the backoff delay.
const JITTER_FRACTION: f64 = 0.25;

#[derive(Debug, Error, PartialEq)]
pub enum PushError {
    #[error("no access token available")]
    NoToken,
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
    #[error("negotiate failed: {0}")]
    Negotiate(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("hub refused handshake: {0}")]
    Handshake(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("no traffic from hub within {0:?}")]
    Timeout(Duration),
}

/// Writes one pushed field through the mapper. Returns `false` when the
/// target state does not exist.
pub async fn apply_product_update(mapper: &StateMapper, update: &ProductUpdate) -> Result<bool, MappingError> {
    let field_path = push_field_path(update.id).ok_or(MappingError::UnknownField(update.id))?;
    let value = coerce_push_value(update.data_type, &update.raw_value())?;
    mapper.apply_field(&update.mid, field_path, value).await
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now, before jitter. Doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Adds `fraction` (0..=1) of the jitter allowance to `delay`.
pub fn with_jitter(delay: Duration, fraction: f64) -> Duration {
    delay + delay.mul_f64(JITTER_FRACTION * fraction.clamp(0.0, 1.0))
}

pub fn websocket_url(hub: &Url, connection_key: &str, token: &str) -> Result<Url, PushError> {
    let mut url = hub.clone();
    let scheme = match hub.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(PushError::InvalidUrl(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| PushError::InvalidUrl(hub.to_string()))?;
    url.query_pairs_mut()
        .append_pair("id", connection_key)
        .append_pair("access_token", token);
    Ok(url)
}

/// Reads frames until the handshake answer arrives. Returns the records
/// that shared its frame.
async fn await_handshake<S>(stream: &mut S) -> Result<Vec<String>, PushError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame.map_err(|err| PushError::Closed(err.to_string()))? {
            Message::Text(text) => {
                let mut records = protocol::split_records(&text);
                if let Some(first) = records.next() {
                    protocol::check_handshake(first)?;
                    return Ok(records.map(str::to_string).collect());
                }
            }
            Message::Close(frame) => return Err(PushError::Closed(format!("{frame:?}"))),
            _ => {}
        }
    }
    Err(PushError::Closed("stream ended during handshake".to_string()))
}

enum SessionEnd {
    Shutdown,
}

/// Chargers subscribed on the current connection.
#[derive(Debug, Default)]
struct Subscriptions {
    chargers: HashSet<String>,
    last_invocation: u64,
}

impl Subscriptions {
    /// The subscribe frame for a charger not yet subscribed.
    fn frame_for(&mut self, charger: &str) -> Option<String> {
        if !self.chargers.insert(charger.to_string()) {
            return None;
        }
        self.last_invocation += 1;
        Some(protocol::subscribe_frame(self.last_invocation, charger))
    }
}

pub struct PushListener {
    hub: Url,
    tokens: Arc<dyn TokenSource>,
    mapper: Arc<StateMapper>,
    http: reqwest::Client,
    backoff: Backoff,
    keep_alive: Duration,
    server_timeout: Duration,
}

impl PushListener {
    pub fn new(
        hub_url: &str,
        tokens: Arc<dyn TokenSource>,
        mapper: Arc<StateMapper>,
        request_timeout: Duration,
        reconnect_delay: Duration,
        max_reconnect_delay: Duration,
    ) -> Result<Self, PushError> {
        let hub = Url::parse(hub_url).map_err(|err| PushError::InvalidUrl(format!("{hub_url}: {err}")))?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| PushError::Negotiate(err.to_string()))?;
        Ok(Self {
            hub,
            tokens,
            mapper,
            http,
            backoff: Backoff::new(reconnect_delay, max_reconnect_delay),
            keep_alive: KEEP_ALIVE_INTERVAL,
            server_timeout: SERVER_TIMEOUT,
        })
    }

    #[cfg(test)]
    fn with_timeouts(mut self, keep_alive: Duration, server_timeout: Duration) -> Self {
        self.keep_alive = keep_alive;
        self.server_timeout = server_timeout;
        self
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(hub = %self.hub, "push listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect_and_listen(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Err(err) => warn!(error = %err, "push connection lost"),
            }

            let delay = {
                let fraction: f64 = rand::thread_rng().gen();
                with_jitter(self.backoff.next_delay(), fraction)
            };
            info!(delay_ms = %delay.as_millis(), "reconnecting to push hub");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("push listener stopped");
    }

    async fn negotiate(&self, token: &str) -> Result<NegotiateResponse, PushError> {
        let mut url = self.hub.clone();
        url.path_segments_mut()
            .map_err(|_| PushError::InvalidUrl(self.hub.to_string()))?
            .pop_if_empty()
            .push("negotiate");
        url.query_pairs_mut().append_pair("negotiateVersion", "1");

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| PushError::Negotiate(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Negotiate(format!("http {}", status.as_u16())));
        }
        response
            .json::<NegotiateResponse>()
            .await
            .map_err(|err| PushError::Negotiate(err.to_string()))
    }

    async fn connect_and_listen(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd, PushError> {
        let token = self.tokens.current_token().await.ok_or(PushError::NoToken)?;
        let negotiated = self.negotiate(&token).await?;
        let url = websocket_url(&self.hub, negotiated.connection_key(), &token)?;

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| PushError::Connect(err.to_string()))?;
        let (mut sink, mut stream) = ws.split();
        debug!(connection = %negotiated.connection_id, "push websocket connected");

        sink.send(Message::Text(protocol::handshake_frame()))
            .await
            .map_err(|err| PushError::Closed(err.to_string()))?;

        let leftover = timeout(HANDSHAKE_TIMEOUT, await_handshake(&mut stream))
            .await
            .map_err(|_| PushError::Timeout(HANDSHAKE_TIMEOUT))??;

        self.backoff.reset();

        // Listen before reading the known set so no charger falls in between.
        let mut additions = self.mapper.entity_additions();
        let mut subscriptions = Subscriptions::default();
        for charger in self.mapper.known_entities() {
            if let Some(frame) = subscriptions.frame_for(&charger) {
                sink.send(Message::Text(frame))
                    .await
                    .map_err(|err| PushError::Closed(err.to_string()))?;
            }
        }
        info!(chargers = subscriptions.chargers.len(), "subscribed to push updates");

        for record in &leftover {
            self.handle_record(record).await?;
        }

        let mut keep_alive = interval_at(Instant::now() + self.keep_alive, self.keep_alive);
        let mut last_seen = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Text(protocol::close_frame())).await;
                    let _ = sink.close().await;
                    debug!("push connection closed on shutdown");
                    return Ok(SessionEnd::Shutdown);
                }
                _ = keep_alive.tick() => {
                    sink.send(Message::Text(protocol::ping_frame()))
                        .await
                        .map_err(|err| PushError::Closed(err.to_string()))?;
                }
                _ = sleep_until(last_seen + self.server_timeout) => {
                    return Err(PushError::Timeout(self.server_timeout));
                }
                added = additions.recv() => {
                    let chargers = match added {
                        Ok(charger) => vec![charger],
                        Err(broadcast::error::RecvError::Lagged(_)) => self.mapper.known_entities(),
                        // The mapper holds the sender for as long as we do.
                        Err(broadcast::error::RecvError::Closed) => Vec::new(),
                    };
                    for charger in chargers {
                        if let Some(frame) = subscriptions.frame_for(&charger) {
                            sink.send(Message::Text(frame))
                                .await
                                .map_err(|err| PushError::Closed(err.to_string()))?;
                            info!(%charger, "subscribed to push updates for new charger");
                        }
                    }
                }
                frame = stream.next() => {
                    last_seen = Instant::now();
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            for record in protocol::split_records(&text) {
                                self.handle_record(record).await?;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(PushError::Closed(format!("{frame:?}")));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(PushError::Closed(err.to_string())),
                        None => return Err(PushError::Closed("stream ended".to_string())),
                    }
                }
            }
        }
    }

    /// Errors only for a hub-initiated close; bad records are logged.
    async fn handle_record(&self, record: &str) -> Result<(), PushError> {
        let message = match HubMessage::parse(record) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, record, "unreadable hub record skipped");
                return Ok(());
            }
        };

        match message {
            HubMessage::Invocation { target, arguments } if target == TARGET_PRODUCT_UPDATE => {
                let update = match ProductUpdate::from_arguments(&arguments) {
                    Ok(update) => update,
                    Err(err) => {
                        debug!(error = %err, "malformed product update skipped");
                        return Ok(());
                    }
                };
                match apply_product_update(&self.mapper, &update).await {
                    Ok(true) => debug!(charger = %update.mid, field = update.id, "push update applied"),
                    Ok(false) => {}
                    Err(err) => debug!(charger = %update.mid, field = update.id, error = %err, "push update dropped"),
                }
            }
            HubMessage::Invocation { target, .. } => debug!(%target, "ignored hub invocation"),
            HubMessage::Completion { invocation_id, error: Some(error) } => {
                warn!(?invocation_id, %error, "hub invocation failed");
            }
            HubMessage::Completion { .. } | HubMessage::Ping | HubMessage::Other(_) => {}
            HubMessage::Close { error } => {
                return Err(PushError::Closed(error.unwrap_or_else(|| "closed by hub".to_string())));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(5);

    struct FixedToken;

    #[async_trait::async_trait]
    impl TokenSource for FixedToken {
        async fn current_token(&self) -> Option<String> {
            Some("token-1".to_string())
        }
    }

    /// Server end of one hub connection.
    struct HubPeer {
        received: mpsc::UnboundedReceiver<String>,
        outgoing: mpsc::UnboundedSender<String>,
    }

    impl HubPeer {
        async fn next_text(&mut self) -> String {
            timeout(WAIT, self.received.recv())
                .await
                .expect("frame in time")
                .expect("connection open")
        }

        fn send(&self, text: String) {
            self.outgoing.send(text).expect("hub writer");
        }

        async fn complete_handshake(&mut self) {
            assert_eq!(self.next_text().await, protocol::handshake_frame());
            self.send(format!("{{}}{}", protocol::RECORD_SEPARATOR));
        }
    }

    /// Answers one negotiate POST and returns the request head.
    async fn answer_negotiate(listener: &TcpListener) -> String {
        let (mut socket, _) = listener.accept().await.expect("negotiate connection");
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let read = socket.read(&mut buf).await.expect("read request");
            if read == 0 {
                break;
            }
            request.extend_from_slice(&buf[..read]);
        }

        let body = r#"{"connectionId":"conn-1","connectionToken":"tok-1","negotiateVersion":1}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.expect("write response");
        let _ = socket.shutdown().await;
        String::from_utf8_lossy(&request).into_owned()
    }

    async fn accept_hub(listener: &TcpListener) -> HubPeer {
        let (socket, _) = listener.accept().await.expect("websocket connection");
        let ws = accept_async(socket).await.expect("websocket upgrade");
        let (mut sink, mut stream) = ws.split();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                if let Message::Text(text) = frame {
                    if received_tx.send(text).is_err() {
                        break;
                    }
                }
            }
        });
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        HubPeer { received, outgoing }
    }

    async fn local_hub() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}/hubs/chargers", listener.local_addr().expect("addr"));
        (listener, url)
    }

    fn update(id: u16, data_type: u8, value: &str) -> ProductUpdate {
        ProductUpdate {
            mid: "EH1".to_string(),
            id,
            data_type,
            value: json!(value),
        }
    }

    async fn mapper() -> (Arc<MemoryStore>, StateMapper) {
        let store = Arc::new(MemoryStore::new());
        let mapper = StateMapper::new(store.clone());
        mapper.ensure_skeleton("EH1").await.expect("skeleton");
        (store, mapper)
    }

    #[tokio::test]
    async fn pushed_values_land_on_their_states() {
        let (store, mapper) = mapper().await;

        assert!(apply_product_update(&mapper, &update(103, 2, "1")).await.expect("bool"));
        assert!(apply_product_update(&mapper, &update(120, 3, "3.5")).await.expect("float"));
        assert!(apply_product_update(&mapper, &update(109, 4, "7")).await.expect("int"));

        assert_eq!(store.value("EH1.status.cableLocked"), Some(json!(true)));
        assert_eq!(store.value("EH1.status.totalPower"), Some(json!(3.5)));
        assert_eq!(store.value("EH1.status.chargerOpMode"), Some(json!(7)));
        assert!(store.state("EH1.status.totalPower").expect("state").ack);
    }

    #[tokio::test]
    async fn unknown_ids_and_types_write_nothing() {
        let (store, mapper) = mapper().await;

        let unknown_id = apply_product_update(&mapper, &update(9999, 3, "1.0")).await;
        let unknown_type = apply_product_update(&mapper, &update(120, 6, "{}")).await;

        assert_eq!(unknown_id, Err(MappingError::UnknownField(9999)));
        assert_eq!(unknown_type, Err(MappingError::UnsupportedType(6)));
        assert_eq!(store.value("EH1.status.totalPower"), None);
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));

        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        backoff.reset();

        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_adds_at_most_a_quarter() {
        let delay = Duration::from_secs(8);

        assert_eq!(with_jitter(delay, 0.0), delay);
        assert_eq!(with_jitter(delay, 1.0), Duration::from_secs(10));
        assert_eq!(with_jitter(delay, 7.0), Duration::from_secs(10));
    }

    #[test]
    fn websocket_url_carries_connection_and_token() {
        let hub = Url::parse("https://streams.easee.com/hubs/chargers").expect("url");

        let url = websocket_url(&hub, "conn-1", "a.b+c").expect("ws url");

        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/hubs/chargers");
        assert_eq!(url.query(), Some("id=conn-1&access_token=a.b%2Bc"));
    }

    #[tokio::test]
    async fn live_connection_subscribes_new_chargers_and_closes_on_shutdown() {
        // Arrange
        let (listener, hub_url) = local_hub().await;
        let (store, mapper) = mapper().await;
        let mapper = Arc::new(mapper);
        let push = PushListener::new(
            &hub_url,
            Arc::new(FixedToken),
            mapper.clone(),
            WAIT,
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .expect("listener");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(push.run(shutdown_rx));

        // Act
        let negotiate = answer_negotiate(&listener).await;
        let mut hub = accept_hub(&listener).await;
        hub.complete_handshake().await;
        let known = hub.next_text().await;
        mapper.ensure_skeleton("EH2").await.expect("EH2 skeleton");
        let added = hub.next_text().await;
        hub.send(format!(
            r#"{{"type":1,"target":"ProductUpdate","arguments":[{{"mid":"EH2","dataType":3,"id":120,"value":"7.5"}}]}}{}"#,
            protocol::RECORD_SEPARATOR
        ));
        let pushed = timeout(WAIT, async {
            loop {
                if let Some(value) = store.value("EH2.status.totalPower") {
                    break value;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pushed value");
        shutdown_tx.send(true).expect("shutdown");
        let closing = hub.next_text().await;
        timeout(WAIT, task).await.expect("listener stops").expect("join");

        // Assert
        assert!(negotiate.starts_with("POST /hubs/chargers/negotiate?negotiateVersion=1 "));
        assert!(negotiate.to_ascii_lowercase().contains("authorization: bearer token-1"));
        assert_eq!(known, protocol::subscribe_frame(1, "EH1"));
        assert_eq!(added, protocol::subscribe_frame(2, "EH2"));
        assert_eq!(pushed, json!(7.5));
        assert_eq!(closing, protocol::close_frame());
    }

    #[tokio::test]
    async fn silent_hub_is_dropped_after_pings_and_backoff_restarts() {
        // Arrange
        let (listener, hub_url) = local_hub().await;
        let (_store, mapper) = mapper().await;
        let mut push = PushListener::new(
            &hub_url,
            Arc::new(FixedToken),
            Arc::new(mapper),
            WAIT,
            Duration::from_millis(100),
            Duration::from_secs(10),
        )
        .expect("listener")
        .with_timeouts(Duration::from_millis(100), Duration::from_millis(350));
        for _ in 0..3 {
            push.backoff.next_delay();
        }
        let server = tokio::spawn(async move {
            answer_negotiate(&listener).await;
            let mut hub = accept_hub(&listener).await;
            hub.complete_handshake().await;
            let mut frames = Vec::new();
            while let Some(frame) = hub.received.recv().await {
                frames.push(frame);
            }
            frames
        });
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        // Act
        let started = Instant::now();
        let ended = push.connect_and_listen(&mut shutdown_rx).await;
        let elapsed = started.elapsed();
        let frames = timeout(WAIT, server).await.expect("server done").expect("join");

        // Assert
        assert_eq!(ended.err(), Some(PushError::Timeout(Duration::from_millis(350))));
        assert!(elapsed >= Duration::from_millis(350));
        assert_eq!(frames.first(), Some(&protocol::subscribe_frame(1, "EH1")));
        let pings = frames.iter().filter(|f| **f == protocol::ping_frame()).count();
        assert!(pings >= 2, "expected keep-alive pings, got {frames:?}");
        assert_eq!(push.backoff.next_delay(), Duration::from_millis(100));
    }
}
