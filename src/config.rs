use std::{fmt, str::FromStr};

use url::Url;

use crate::{
    error::{Error, Result},
    session::{self, Session},
};

/// Where resolved streams end up.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum SinkKind {
    /// Spawn the fetch and playback processes.
    #[default]
    Pipeline,

    /// Log what would be played without spawning anything.
    Mock,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline => write!(f, "pipeline"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

impl FromStr for SinkKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pipeline" => Ok(Self::Pipeline),
            "mock" => Ok(Self::Mock),
            other => Err(Error::invalid_argument(format!("unknown sink `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub user_agent: String,

    /// Base URL that catalog method names are appended to.
    pub api_url: Url,

    /// API version sent as `v` with every catalog call.
    pub client_version: String,

    /// Whether to connect to the pubsub service over TLS.
    pub secure_pubsub: bool,

    /// Name this player announces itself with.
    pub player_id: String,

    pub session: Session,

    pub sink: SinkKind,

    /// Argument vector of the fetch stage, with `{host}`, `{app}` and
    /// `{surl}` placeholders.
    pub fetch_command: Vec<String>,

    /// Argument vector of the playback stage, reading from stdin.
    pub play_command: Vec<String>,
}

impl Config {
    pub const DEFAULT_API_URL: &'static str = "https://www.rdio.com/api/1/";
    pub const DEFAULT_CLIENT_VERSION: &'static str = "20130124";
    pub const DEFAULT_FETCH_COMMAND: &'static str =
        "rtmpdump -q -r rtmpe://{host}{app} -y mp3:{surl} -o -";
    pub const DEFAULT_PLAY_COMMAND: &'static str = "mplayer -cache 2048 -quiet -";

    /// Creates a configuration with defaults for everything but the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the package name or version would not make a
    /// valid `User-Agent`.
    pub fn with_session(session: Session) -> Result<Self> {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.is_empty()
            || app_version.contains(illegal_chars)
        {
            return Err(Error::invalid_argument(format!(
                "application name and/or version invalid (\"{app_name}\"; \"{app_version}\")"
            )));
        }

        let user_agent = format!(
            "{app_name}/{app_version} (Rust; {}/{})",
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        trace!("user agent: {user_agent}");

        let player_id = session::player_id();
        debug!("player id: {player_id}");

        Ok(Self {
            app_name,
            app_version,
            user_agent,

            api_url: Url::parse(Self::DEFAULT_API_URL)?,
            client_version: Self::DEFAULT_CLIENT_VERSION.to_owned(),
            secure_pubsub: false,
            player_id,

            session,

            sink: SinkKind::default(),
            fetch_command: split_command(Self::DEFAULT_FETCH_COMMAND),
            play_command: split_command(Self::DEFAULT_PLAY_COMMAND),
        })
    }
}

/// Splits a command line on whitespace into an argument vector.
#[must_use]
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(ToOwned::to_owned).collect()
}
