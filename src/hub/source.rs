use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info};

use crate::auth::HeaderProvider;
use crate::config::WebsocketConfig;
use crate::domain::ConnectionState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

/// Upstream frame source. Owns the connection to the authority's feed and
/// pushes every received frame to the outbound channel. The outbound channel
/// closes when the source gives up, which cascades hub shutdown.
#[async_trait]
pub trait Source: Send + Sync {
    /// Try to open the stream, retrying every `reconnectIntervalSec` until
    /// the `reconnectTimeoutSec` window is exhausted.
    async fn connect(&self) -> bool;
    /// Read frames until the connection drops for good. Owns the outbound
    /// sender for its whole lifetime.
    async fn listen(&self);
    /// Close the stream and suppress any further reconnect.
    async fn disconnect(&self);
    fn ready_state(&self) -> ConnectionState;
    fn feed_url(&self) -> String;
    /// Hand out the outbound receiver. Yields once.
    fn take_receiver(&self) -> Option<mpsc::Receiver<Vec<u8>>>;
}

/// Source backed by a websocket connection, authenticated per attempt with
/// the current bearer token.
pub struct WebsocketSource {
    feed_url: String,
    reconnect_timeout: Duration,
    reconnect_interval: Duration,
    auth_provider: Arc<dyn HeaderProvider>,

    ready_state: RwLock<ConnectionState>,
    should_reconnect: AtomicBool,
    writer: tokio::sync::Mutex<Option<WsWriter>>,
    reader: Mutex<Option<WsReader>>,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl WebsocketSource {
    pub fn new(feed_url: &str, config: &WebsocketConfig, auth_provider: Arc<dyn HeaderProvider>) -> Self {
        let (tx, rx) = mpsc::channel(1);

        Self {
            feed_url: feed_url.to_string(),
            reconnect_timeout: Duration::from_secs(config.reconnect_timeout_sec),
            reconnect_interval: Duration::from_secs(config.reconnect_interval_sec),
            auth_provider,
            ready_state: RwLock::new(ConnectionState::Closed),
            should_reconnect: AtomicBool::new(true),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    fn set_ready_state(&self, state: ConnectionState) {
        *self.ready_state.write().expect("state lock poisoned") = state;
    }

    async fn dial(&self) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut request = self.feed_url.as_str().into_client_request()?;

        // the auth header map comes from the http client stack; carry the
        // entries over by name/value
        for (name, value) in self.auth_provider.auth_header().iter() {
            if let Ok(text) = value.to_str() {
                if let (Ok(header_name), Ok(header_value)) = (
                    HeaderName::from_bytes(name.as_str().as_bytes()),
                    HeaderValue::from_str(text),
                ) {
                    request.headers_mut().insert(header_name, header_value);
                }
            }
        }

        let (stream, _) = connect_async(request).await?;
        let (writer, reader) = stream.split();

        *self.writer.lock().await = Some(writer);
        *self.reader.lock().expect("reader lock poisoned") = Some(reader);
        self.set_ready_state(ConnectionState::Open);

        Ok(())
    }

    fn take_reader(&self) -> Option<WsReader> {
        self.reader.lock().expect("reader lock poisoned").take()
    }

    async fn reply_pong(&self, payload: Vec<u8>) {
        let mut writer = self.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            if let Err(e) = writer.send(Message::Pong(payload)).await {
                error!("WebsocketSource: error on pong reply, err: {}", e);
            }
        }
    }
}

#[async_trait]
impl Source for WebsocketSource {
    async fn connect(&self) -> bool {
        self.set_ready_state(ConnectionState::Connecting);

        let start = Instant::now();
        while start.elapsed() < self.reconnect_timeout {
            match self.dial().await {
                Ok(()) => {
                    info!("WebsocketSource: connected to feed {}", self.feed_url);
                    return true;
                }
                Err(e) => {
                    error!(
                        "WebsocketSource: cannot connect to feed: {}, retry connection in {:?}",
                        e, self.reconnect_interval
                    );
                    tokio::time::sleep(self.reconnect_interval).await;
                }
            }
        }

        self.set_ready_state(ConnectionState::Closed);
        false
    }

    async fn listen(&self) {
        // owning the sender here closes the outbound channel on return
        let tx = match self.tx.lock().expect("sender lock poisoned").take() {
            Some(tx) => tx,
            None => return,
        };

        'outer: loop {
            let mut reader = match self.take_reader() {
                Some(reader) => reader,
                None => break,
            };

            loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if tx.send(text.into_bytes()).await.is_err() {
                            break 'outer;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if tx.send(data).await.is_err() {
                            break 'outer;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => self.reply_pong(payload).await,
                    Some(Ok(_)) => {}
                    other => {
                        // closed on request
                        if !self.should_reconnect.load(Ordering::SeqCst) {
                            break 'outer;
                        }

                        // either connection issue or issue reading the frame
                        if let Some(Err(e)) = other {
                            error!("WebsocketSource: unexpected connection error: {}", e);
                        }
                        if !self.connect().await {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                }
            }
        }

        self.writer.lock().await.take();
        self.set_ready_state(ConnectionState::Closed);
        drop(tx);
    }

    async fn disconnect(&self) {
        info!("WebsocketSource: disconnecting from feed {}", self.feed_url);

        self.should_reconnect.store(false, Ordering::SeqCst);

        let mut writer = self.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            if let Err(e) = writer.send(Message::Close(None)).await {
                error!("WebsocketSource: error on send close frame, err: {}", e);
            }
        }

        self.set_ready_state(ConnectionState::Closed);
    }

    fn ready_state(&self) -> ConnectionState {
        *self.ready_state.read().expect("state lock poisoned")
    }

    fn feed_url(&self) -> String {
        self.feed_url.clone()
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.rx.lock().expect("receiver lock poisoned").take()
    }
}
