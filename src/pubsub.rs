//! Self-healing websocket channel to the pubsub service.
//!
//! A [`Channel`] looks up the pubsub endpoint and token through a
//! [`Locator`], opens a websocket and sends the `CONNECT` handshake. From
//! then on [`Channel::recv`] yields inbound frames and hides transport
//! loss: when the socket closes or errors, the channel reconnects with
//! exponential backoff, repeats the handshake and keeps reading. Callers
//! see the server's `CONNECTED` frame again after every reconnect, which is
//! their cue to resubscribe.
//!
//! Writes while the transport is down fail with [`Error::channel_closed`].

use std::{ops::ControlFlow, sync::Arc, time::Duration};

use async_trait::async_trait;
use exponential_backoff::Backoff;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message as WebsocketMessage, MaybeTlsStream, WebSocketStream};

use crate::{
    error::{Error, Result},
    protocol::{
        catalog::PubSubInfo,
        pubsub::{Capabilities, ChannelName, Inbound, Outbound},
    },
};

/// Finds the pubsub endpoint and a token to authenticate with.
#[async_trait]
pub trait Locator: Send + Sync {
    async fn pubsub_info(&self) -> Result<PubSubInfo>;
}

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Channel {
    locator: Arc<dyn Locator>,
    capabilities: Capabilities,
    scheme: &'static str,

    ws_tx: Option<SplitSink<Stream, WebsocketMessage>>,
    ws_rx: Option<SplitStream<Stream>>,
}

impl Channel {
    /// Frames larger than this are dropped unparsed.
    const MAX_MESSAGE_SIZE: usize = 64 * 1024;

    const RECONNECT_ATTEMPTS: u32 = 10;
    const MIN_BACKOFF: Duration = Duration::from_millis(500);
    const MAX_BACKOFF: Duration = Duration::from_secs(60);

    /// Connects and sends the `CONNECT` handshake.
    ///
    /// # Errors
    ///
    /// Returns a connect error if the endpoint lookup or websocket
    /// handshake fails.
    pub async fn connect(
        locator: Arc<dyn Locator>,
        capabilities: Capabilities,
        secure: bool,
    ) -> Result<Self> {
        let scheme = if secure { "wss" } else { "ws" };
        debug!("pubsub scheme: {scheme}");

        let mut channel = Self {
            locator,
            capabilities,
            scheme,
            ws_tx: None,
            ws_rx: None,
        };
        channel.establish().await?;

        Ok(channel)
    }

    async fn establish(&mut self) -> Result<()> {
        self.teardown();

        let info = self.locator.pubsub_info().await.map_err(Error::connect)?;
        let server = info
            .servers
            .first()
            .ok_or_else(|| Error::connect("no pubsub servers available"))?;

        let url = format!("{}://{server}", self.scheme);
        debug!("connecting to {url}");
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(Error::connect)?;
        let (mut ws_tx, ws_rx) = ws_stream.split();

        // Keep the transport only once the handshake is out.
        let connect = Outbound::Connect {
            token: info.token,
            capabilities: self.capabilities.clone(),
        };
        trace!("sending: {connect:?}");
        ws_tx
            .send(WebsocketMessage::Text(connect.to_string().into()))
            .await
            .map_err(Error::connect)?;

        self.ws_tx = Some(ws_tx);
        self.ws_rx = Some(ws_rx);
        Ok(())
    }

    fn teardown(&mut self) {
        self.ws_tx = None;
        self.ws_rx = None;
    }

    /// Whether a transport is currently established.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ws_tx.is_some()
    }

    async fn reconnect(&mut self) {
        loop {
            let backoff = Backoff::new(
                Self::RECONNECT_ATTEMPTS,
                Self::MIN_BACKOFF,
                Self::MAX_BACKOFF,
            );
            for delay in &backoff {
                match self.establish().await {
                    Ok(()) => {
                        info!("reconnected to pubsub");
                        return;
                    }
                    Err(e) => {
                        let delay = delay.unwrap_or(Self::MAX_BACKOFF);
                        warn!(
                            "reconnecting failed: {e}; retrying in {:.1}s",
                            delay.as_secs_f32()
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Waits for the next inbound frame, reconnecting as needed.
    ///
    /// Frames that cannot be parsed are logged and skipped.
    pub async fn recv(&mut self) -> Inbound {
        loop {
            let Some(ws_rx) = self.ws_rx.as_mut() else {
                self.reconnect().await;
                continue;
            };

            match ws_rx.next().await {
                Some(Ok(message)) => {
                    if let Some(frame) = self.handle_message(message) {
                        return frame;
                    }
                }
                Some(Err(e)) => {
                    warn!("pubsub connection lost: {e}");
                    self.teardown();
                }
                None => {
                    warn!("pubsub connection closed");
                    self.teardown();
                }
            }
        }
    }

    fn handle_message(&mut self, message: WebsocketMessage) -> Option<Inbound> {
        match message {
            WebsocketMessage::Text(text) => {
                // Do not parse exceedingly large messages to prevent out of
                // memory conditions.
                if text.len() > Self::MAX_MESSAGE_SIZE {
                    error!("ignoring oversized frame with {} bytes", text.len());
                    return None;
                }

                trace!("received: {}", &*text);
                match text.parse::<Inbound>() {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        warn!("ignoring frame: {e}");
                        None
                    }
                }
            }
            WebsocketMessage::Close(payload) => {
                info!("pubsub connection closed by server: {payload:?}");
                self.teardown();
                None
            }
            // Pongs are queued by tungstenite and sent on the next read or
            // write.
            WebsocketMessage::Ping(_) => {
                trace!("ping -> pong");
                None
            }
            _ => {
                trace!("message type unimplemented");
                None
            }
        }
    }

    /// Sends a frame on the current transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::channel_closed`] if no transport is established, or
    /// the websocket error if writing fails. In the latter case the
    /// transport is torn down and [`Channel::recv`] reconnects.
    pub async fn send(&mut self, frame: &Outbound) -> Result<()> {
        trace!("sending: {frame:?}");
        let Some(ws_tx) = self.ws_tx.as_mut() else {
            return Err(Error::channel_closed());
        };

        let result = ws_tx
            .send(WebsocketMessage::Text(frame.to_string().into()))
            .await;
        if let Err(e) = result {
            self.teardown();
            return Err(e.into());
        }

        Ok(())
    }

    /// Subscribes to a channel.
    ///
    /// # Errors
    ///
    /// See [`Channel::send`].
    pub async fn subscribe(&mut self, channel: ChannelName) -> Result<()> {
        self.send(&Outbound::Subscribe(channel)).await
    }

    /// Publishes a payload on a channel.
    ///
    /// # Errors
    ///
    /// See [`Channel::send`].
    pub async fn publish(&mut self, channel: ChannelName, payload: String) -> Result<()> {
        self.send(&Outbound::Publish(channel, payload)).await
    }

    /// Feeds inbound frames to `handler` until it breaks.
    pub async fn run<F, B>(&mut self, mut handler: F) -> B
    where
        F: FnMut(Inbound) -> ControlFlow<B>,
    {
        loop {
            if let ControlFlow::Break(value) = handler(self.recv().await) {
                return value;
            }
        }
    }

    /// Closes the transport without reconnecting.
    pub async fn close(&mut self) {
        if let Some(mut ws_tx) = self.ws_tx.take() {
            if let Err(e) = ws_tx.close().await {
                debug!("error closing pubsub connection: {e}");
            }
        }
        self.ws_rx = None;
    }
}

#[cfg(test)]
mod tests {
    use tokio::{net::TcpListener, sync::mpsc, time::timeout};

    use super::*;
    use crate::protocol::pubsub::Topic;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct LocalServer {
        address: String,
    }

    #[async_trait]
    impl Locator for LocalServer {
        async fn pubsub_info(&self) -> Result<PubSubInfo> {
            Ok(PubSubInfo {
                servers: vec![self.address.clone()],
                token: "t0k3n".to_owned(),
            })
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Locator for Unreachable {
        async fn pubsub_info(&self) -> Result<PubSubInfo> {
            Err(Error::unavailable("no route to host"))
        }
    }

    async fn listen() -> (TcpListener, Arc<dyn Locator>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        (listener, Arc::new(LocalServer { address }))
    }

    fn capabilities() -> Capabilities {
        Capabilities::remote_player("_remoteslave_000001")
    }

    #[tokio::test]
    async fn handshakes_and_receives_frames() {
        let (listener, locator) = listen().await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let connect = ws.next().await.unwrap().unwrap();
            seen_tx.send(connect.to_text().unwrap().to_owned()).unwrap();

            ws.send(WebsocketMessage::Text("CONNECTED".into())).await.unwrap();
            let subscribe = ws.next().await.unwrap().unwrap();
            seen_tx.send(subscribe.to_text().unwrap().to_owned()).unwrap();

            ws.send(WebsocketMessage::Text(
                r#"PUB s1/player|{"event":"masterQuery"}"#.into(),
            ))
            .await
            .unwrap();
            // Keep the connection open until the client is done.
            let _ = ws.next().await;
        });

        let mut channel = Channel::connect(locator, capabilities(), false).await.unwrap();
        assert_eq!(
            timeout(TIMEOUT, seen_rx.recv()).await.unwrap().unwrap(),
            r#"CONNECT t0k3n|{"player":{"canRemote":true,"name":"_remoteslave_000001"}}"#
        );

        assert_eq!(timeout(TIMEOUT, channel.recv()).await.unwrap(), Inbound::Connected);
        channel
            .subscribe(ChannelName::new("s1", Topic::Player))
            .await
            .unwrap();
        assert_eq!(
            timeout(TIMEOUT, seen_rx.recv()).await.unwrap().unwrap(),
            "SUB s1/player"
        );

        let frame = timeout(TIMEOUT, channel.recv()).await.unwrap();
        assert_eq!(
            frame,
            Inbound::Publish {
                channel: ChannelName::new("s1", Topic::Player),
                payload: r#"{"event":"masterQuery"}"#.to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn reconnects_transparently() {
        let (listener, locator) = listen().await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            // First connection: complete the handshake, then drop it.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _connect = ws.next().await.unwrap().unwrap();
            ws.send(WebsocketMessage::Text("CONNECTED".into())).await.unwrap();
            drop(ws);

            // Second connection: the client should repeat the handshake.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let connect = ws.next().await.unwrap().unwrap();
            seen_tx.send(connect.to_text().unwrap().to_owned()).unwrap();
            ws.send(WebsocketMessage::Text("CONNECTED".into())).await.unwrap();
            let _ = ws.next().await;
        });

        let mut channel = Channel::connect(locator, capabilities(), false).await.unwrap();
        assert_eq!(timeout(TIMEOUT, channel.recv()).await.unwrap(), Inbound::Connected);

        // The next frame can only come from the second connection.
        assert_eq!(timeout(TIMEOUT, channel.recv()).await.unwrap(), Inbound::Connected);
        let connect = timeout(TIMEOUT, seen_rx.recv()).await.unwrap().unwrap();
        assert!(connect.starts_with("CONNECT t0k3n|"));
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let (listener, locator) = listen().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut channel = Channel::connect(locator, capabilities(), false).await.unwrap();
        channel.close().await;
        assert!(!channel.is_open());

        let err = channel
            .publish(ChannelName::new("s1", Topic::Player), "{}".to_owned())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn failed_lookup_is_connect_error() {
        let result = Channel::connect(Arc::new(Unreachable), capabilities(), false).await;
        let err = result.err().unwrap();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn runs_handler_until_break() {
        let (listener, locator) = listen().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _connect = ws.next().await;
            for _ in 0..3 {
                ws.send(WebsocketMessage::Text("CONNECTED".into())).await.unwrap();
            }
            let _ = ws.next().await;
        });

        let mut channel = Channel::connect(locator, capabilities(), false).await.unwrap();
        let mut count = 0;
        let total = timeout(
            TIMEOUT,
            channel.run(|frame| {
                assert_eq!(frame, Inbound::Connected);
                count += 1;
                if count == 3 {
                    ControlFlow::Break(count)
                } else {
                    ControlFlow::Continue(())
                }
            }),
        )
        .await
        .unwrap();
        assert_eq!(total, 3);
    }
}
