//! One remote-control session.
//!
//! A [`Client`] connects to the pubsub service, restores the stored player
//! state and then drives the [`Player`] from three sources until it is
//! evicted or fails:
//!
//! 1. frames the player wants published
//! 2. follow-up events: catalog results, saves and stream ends
//! 3. inbound pubsub frames
//!
//! Sources are polled in that order, so that announcements go out before
//! new commands are read.

use std::{ops::ControlFlow, sync::Arc};

use tokio::sync::mpsc;

use crate::{
    config::{Config, SinkKind},
    error::Result,
    gateway::{Catalog, Gateway},
    pipeline::{self, OnEnded, Pipeline, Sink},
    player::{Event, Evicted, Player},
    protocol::pubsub::Capabilities,
    pubsub::{Channel, Locator},
};

pub struct Client {
    config: Config,
    gateway: Arc<Gateway>,
}

impl Client {
    /// Creates a client for the session in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog gateway cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            gateway: Arc::new(Gateway::new(config)?),
        })
    }

    fn sink(&self, events: &mpsc::UnboundedSender<Event>) -> Box<dyn Sink> {
        match self.config.sink {
            SinkKind::Pipeline => {
                let events = events.clone();
                let on_ended: OnEnded = Arc::new(move |generation| {
                    let _ = events.send(Event::StreamEnded(generation));
                });
                Box::new(Pipeline::new(
                    self.config.fetch_command.clone(),
                    self.config.play_command.clone(),
                    on_ended,
                ))
            }
            SinkKind::Mock => Box::new(pipeline::Mock::default()),
        }
    }

    /// Runs a session until another player takes over.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting or restoring state fails, or if the
    /// player fails fatally. Other errors of the player are logged and the
    /// session continues.
    pub async fn start(&mut self) -> Result<Evicted> {
        let catalog = Arc::clone(&self.gateway) as Arc<dyn Catalog>;
        let locator = Arc::clone(&self.gateway) as Arc<dyn Locator>;
        self.run(catalog, locator).await
    }

    async fn run(&self, catalog: Arc<dyn Catalog>, locator: Arc<dyn Locator>) -> Result<Evicted> {
        let capabilities = Capabilities::remote_player(&self.config.player_id);
        let mut channel = Channel::connect(locator, capabilities, self.config.secure_pubsub).await?;
        info!("connected as {}", self.config.player_id);

        let stored = match catalog.get_player_state().await {
            Ok(stored) => stored,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();

        let sink = self.sink(&events_tx);
        let mut player = Player::new(
            &self.config.session.user_key,
            &self.config.player_id,
            catalog,
            sink,
            events_tx,
            outbox_tx,
        );
        player.load(stored);

        let result = loop {
            let event = tokio::select! {
                biased;

                Some(frame) = outbox_rx.recv() => {
                    if let Err(e) = channel.send(&frame).await {
                        warn!("not sent: {frame:?} ({e})");
                    }
                    continue;
                }

                Some(event) = events_rx.recv() => event,

                frame = channel.recv() => Event::Frame(frame),
            };

            match player.handle(event) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(evicted)) => break Ok(evicted),
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) => error!("{e}"),
            }
        };

        player.stop();
        channel.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::{net::TcpListener, time::timeout};
    use tokio_tungstenite::tungstenite::Message as WebsocketMessage;

    use super::*;
    use crate::{
        error::Error,
        protocol::catalog::{
            Object, PubSubInfo, QueueEntry, SavedState, StoredState, StreamDescriptor, TrackRef,
        },
        session::Session,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);
    const PLAYER_ID: &str = "_remoteslave_000007";

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

    /// A catalog that only knows the stored state of one album.
    struct StoredAlbum;

    #[async_trait]
    impl Catalog for StoredAlbum {
        async fn get(&self, _keys: &[String], _extras: &[&str]) -> Result<HashMap<String, Object>> {
            Ok(HashMap::new())
        }

        async fn generate_station(
            &self,
            _station_key: &str,
            _exclude: &[String],
        ) -> Result<Vec<TrackRef>> {
            Err(Error::not_found("no stations"))
        }

        async fn get_playback_info(&self, track_key: &str) -> Result<StreamDescriptor> {
            Ok(StreamDescriptor {
                surl: format!("surl-{track_key}"),
                stream_host: "host".to_owned(),
                stream_app: "/app".to_owned(),
            })
        }

        async fn get_player_state(&self) -> Result<StoredState> {
            Ok(serde_json::from_value(json!({
                "playerState": {
                    "currentSource": {
                        "key": "al1",
                        "type": "al",
                        "tracks": {"items": [{"key": "t1"}, {"key": "t2"}]},
                        "currentPosition": 0,
                    },
                },
                "queue": {"data": []},
            }))?)
        }

        async fn save_player_state(&self, _state: &SavedState, _queue: &[QueueEntry]) -> Result<()> {
            Ok(())
        }
    }

    fn client() -> Client {
        let session: Session = "user_key = \"s1\"\nauthorization_key = \"auth\"\n[cookies]\nr = \"c1\""
            .parse()
            .unwrap();
        let mut config = Config::with_session(session).unwrap();
        config.player_id = PLAYER_ID.to_owned();
        config.secure_pubsub = false;
        config.sink = SinkKind::Mock;
        Client::new(&config).unwrap()
    }

    #[tokio::test]
    async fn subscribes_before_serving_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let locator = Arc::new(LocalServer {
            address: listener.local_addr().unwrap().to_string(),
        });

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _connect = ws.next().await.unwrap().unwrap();

            // A command right behind the handshake, before any subscription.
            ws.send(WebsocketMessage::Text("CONNECTED".into())).await.unwrap();
            ws.send(WebsocketMessage::Text(
                r#"PUB s1/private|{"event":"remote","command":{"type":"togglePause"}}"#.into(),
            ))
            .await
            .unwrap();

            let mut frames = Vec::new();
            while frames.len() < 6 {
                let frame = ws.next().await.unwrap().unwrap();
                frames.push(frame.to_text().unwrap().to_owned());
            }

            ws.send(WebsocketMessage::Text(
                r#"PUB s1/player|{"event":"masterPlayer","name":"_web_9","playState":1}"#.into(),
            ))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
            frames
        });

        let catalog = Arc::new(StoredAlbum) as Arc<dyn Catalog>;
        let evicted = timeout(TIMEOUT, client().run(catalog, locator))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(evicted.by, "_web_9");

        let frames = timeout(TIMEOUT, server).await.unwrap().unwrap();
        assert_eq!(
            frames[..4],
            [
                "SUB s1/private",
                "SUB s1/presence",
                "SUB s1/fields",
                "SUB s1/player",
            ]
        );
        // The claim, then the pause it was asked for.
        assert!(frames[4].contains(r#""name":"_remoteslave_000007""#));
        assert!(frames[4].contains(r#""playState":1"#));
        assert!(frames[5].contains(r#""playState":0"#));
    }
}
