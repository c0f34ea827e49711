//! Catalog API client.
//!
//! Every catalog call is a form-encoded `POST` to `<api_url>/<method>` that
//! carries the API version, the account's authorization key and the method
//! name, plus method-specific parameters:
//!
//! ```text
//! POST /api/1/getPlaybackInfo
//! Cookie: r=...
//!
//! key=t1&manualPlay=true&type=flash&playerName=_remoteslave_042133&requiresUnlimited=false&v=20130124&_authorization_key=...&method=getPlaybackInfo
//! ```
//!
//! The server answers with a JSON envelope:
//!
//! ```json
//! {"status": "ok", "result": ...}
//! ```
//!
//! Anything but HTTP 200 with status `ok` is an [`ApiFailure`].
//!
//! The player talks to the catalog through the [`Catalog`] trait so that it
//! can be driven by an in-memory catalog in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{
    header::{HeaderValue, CONTENT_TYPE, COOKIE},
    StatusCode, Url,
};
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    config::Config,
    error::{ApiFailure, Error, Result},
    http::Client as HttpClient,
    protocol::{
        self,
        catalog::{
            Generated, Object, PubSubInfo, QueueEntry, SavedState, StoredState, StreamDescriptor,
            TrackRef,
        },
    },
    pubsub::Locator,
};

/// Catalog operations the player depends on.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Looks up objects by key, with optional extra fields such as `tracks`.
    ///
    /// Keys the catalog does not know are absent from the result.
    async fn get(&self, keys: &[String], extras: &[&str]) -> Result<HashMap<String, Object>>;

    /// Generates the continuation of a station, avoiding `exclude`.
    async fn generate_station(&self, station_key: &str, exclude: &[String])
        -> Result<Vec<TrackRef>>;

    /// Resolves where to stream a track from.
    async fn get_playback_info(&self, track_key: &str) -> Result<StreamDescriptor>;

    async fn get_player_state(&self) -> Result<StoredState>;

    async fn save_player_state(&self, state: &SavedState, queue: &[QueueEntry]) -> Result<()>;
}

/// HTTP implementation of [`Catalog`] and the pubsub [`Locator`].
pub struct Gateway {
    http_client: HttpClient,
    api_url: Url,
    client_version: String,
    authorization_key: String,
    cookies: Option<HeaderValue>,
    player_id: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    result: serde_json::Value,
}

impl Gateway {
    const FORM_CONTENT: HeaderValue = HeaderValue::from_static("application/x-www-form-urlencoded");

    const GET: &'static str = "get";
    const GENERATE_STATION: &'static str = "generateStation";
    const GET_PLAYBACK_INFO: &'static str = "getPlaybackInfo";
    const GET_PLAYER_STATE: &'static str = "getPlayerState";
    const SAVE_PLAYER_STATE: &'static str = "savePlayerState";
    const PUBSUB_INFO: &'static str = "pubsubInfo";

    /// Creates a new gateway for the session in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the session
    /// cookies do not make a valid header value.
    pub fn new(config: &Config) -> Result<Self> {
        let cookies = config.session.cookie_header();
        let cookies = if cookies.is_empty() {
            None
        } else {
            let mut value = HeaderValue::from_str(&cookies)?;
            value.set_sensitive(true);
            Some(value)
        };

        Ok(Self {
            http_client: HttpClient::new(config)?,
            api_url: config.api_url.clone(),
            client_version: config.client_version.clone(),
            authorization_key: config.session.authorization_key.clone(),
            cookies,
            player_id: config.player_id.clone(),
        })
    }

    /// Calls catalog `method` with form `params` and decodes its result.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiFailure`] if the server does not answer with HTTP 200
    /// and status `ok`, or a decoding error if the result does not match `T`.
    pub async fn call<T>(&self, method: &str, params: &[(&str, &str)]) -> Result<T>
    where
        T: DeserializeOwned + std::fmt::Debug,
    {
        // Check the URL early to not needlessly hit the rate limiter.
        let url = self.api_url.join(method)?;

        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .append_pair("v", &self.client_version)
            .append_pair("_authorization_key", &self.authorization_key)
            .append_pair("method", method)
            .finish();

        let mut request = self.http_client.post(url, body);
        let headers = request.headers_mut();
        headers.try_insert(CONTENT_TYPE, Self::FORM_CONTENT)?;
        if let Some(cookies) = &self.cookies {
            headers.try_insert(COOKIE, cookies.clone())?;
        }

        let response = self.http_client.execute(request).await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::api_failure(ApiFailure::StatusCode(status.as_u16())));
        }

        let body = response.text().await?;
        let envelope: Envelope = protocol::json(&body, method)?;
        if envelope.status != "ok" {
            return Err(Error::api_failure(ApiFailure::ServerStatus(envelope.status)));
        }

        serde_json::from_value(envelope.result).map_err(|e| {
            error!("{method}: unexpected result ({e})");
            e.into()
        })
    }
}

#[async_trait]
impl Catalog for Gateway {
    async fn get(&self, keys: &[String], extras: &[&str]) -> Result<HashMap<String, Object>> {
        let keys = keys.join(",");
        let extras = extras.join(",");
        self.call(Self::GET, &[("keys", keys.as_str()), ("extras", extras.as_str())])
            .await
    }

    async fn generate_station(
        &self,
        station_key: &str,
        exclude: &[String],
    ) -> Result<Vec<TrackRef>> {
        let exclude = exclude.join(",");
        let generated: Generated = self
            .call(
                Self::GENERATE_STATION,
                &[
                    ("station_key", station_key),
                    ("exclude", exclude.as_str()),
                    ("extras", "-*,key"),
                ],
            )
            .await?;
        Ok(generated.tracks.items)
    }

    async fn get_playback_info(&self, track_key: &str) -> Result<StreamDescriptor> {
        self.call(
            Self::GET_PLAYBACK_INFO,
            &[
                ("key", track_key),
                ("manualPlay", "true"),
                ("type", "flash"),
                ("playerName", self.player_id.as_str()),
                ("requiresUnlimited", "false"),
            ],
        )
        .await
    }

    async fn get_player_state(&self) -> Result<StoredState> {
        self.call(Self::GET_PLAYER_STATE, &[]).await
    }

    async fn save_player_state(&self, state: &SavedState, queue: &[QueueEntry]) -> Result<()> {
        let state = serde_json::to_string(state)?;
        let queue = serde_json::to_string(queue)?;
        let _: serde_json::Value = self
            .call(
                Self::SAVE_PLAYER_STATE,
                &[("player_state", state.as_str()), ("queue", queue.as_str())],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Locator for Gateway {
    async fn pubsub_info(&self) -> Result<PubSubInfo> {
        self.call(Self::PUBSUB_INFO, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::*;
    use crate::{error::ErrorKind, session::Session};

    /// Serves a single HTTP response and returns the request it answered.
    async fn serve_once(status: &'static str, body: &'static str) -> (Url, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/api/1/", listener.local_addr().unwrap())).unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let length = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or_default();
                    if body.len() >= length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (url, handle)
    }

    fn gateway(api_url: Url) -> Gateway {
        let session: Session = "user_key = \"s1\"\nauthorization_key = \"auth\"\n[cookies]\nr = \"c1\""
            .parse()
            .unwrap();
        let mut config = Config::with_session(session).unwrap();
        config.api_url = api_url;
        config.player_id = "_remoteslave_000007".to_owned();
        Gateway::new(&config).unwrap()
    }

    #[tokio::test]
    async fn posts_form_encoded_calls() {
        let (url, request) = serve_once(
            "200 OK",
            r#"{"status":"ok","result":{"surl":"x/y","streamHost":"h","streamApp":"/a"}}"#,
        )
        .await;

        let stream = gateway(url).get_playback_info("t1").await.unwrap();
        assert_eq!(stream.stream_host, "h");
        assert_eq!(stream.stream_app, "/a");

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /api/1/getPlaybackInfo "));
        assert!(request.to_ascii_lowercase().contains("cookie: r=c1"));
        assert!(request.contains("key=t1"));
        assert!(request.contains("playerName=_remoteslave_000007"));
        assert!(request.contains("v=20130124"));
        assert!(request.contains("_authorization_key=auth"));
        assert!(request.contains("method=getPlaybackInfo"));
    }

    #[tokio::test]
    async fn http_status_is_api_failure() {
        let (url, _request) = serve_once("500 Internal Server Error", "{}").await;

        let err = gateway(url).get_player_state().await.unwrap_err();
        assert_eq!(err.downcast::<ApiFailure>(), Some(&ApiFailure::StatusCode(500)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn server_status_is_api_failure() {
        let (url, _request) = serve_once("200 OK", r#"{"status":"error","message":"nope"}"#).await;

        let err = gateway(url).pubsub_info().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
        assert_eq!(
            err.downcast::<ApiFailure>(),
            Some(&ApiFailure::ServerStatus("error".to_owned()))
        );
    }

    #[tokio::test]
    async fn decodes_objects_by_key() {
        let (url, request) = serve_once(
            "200 OK",
            r#"{"status":"ok","result":{"al1":{"key":"al1","type":"al","tracks":{"items":[{"key":"t1"}]}}}}"#,
        )
        .await;

        let objects = gateway(url).get(&["al1".to_owned()], &["tracks"]).await.unwrap();
        assert_eq!(objects["al1"].kind, "al");

        let request = request.await.unwrap();
        assert!(request.contains("keys=al1"));
        assert!(request.contains("extras=tracks"));
    }
}
