//! Catalog objects and player state as exchanged with the catalog API.
//!
//! The catalog describes every playable thing as an object with a `key` and
//! a short `type` code. This module narrows those objects into a closed set
//! of [`Source`] kinds:
//!
//! * [`Source::Track`] - a single playable track (`t`)
//! * [`Source::Albumish`] - an ordered album or playlist (`a`, `al`, `p`)
//! * [`Source::Station`] - an algorithmic station with a rolling lookahead
//!   window (`lr`, `rr`, `h`, `e`, `tr`, `c`)
//!
//! Positional kinds carry a cursor that is always a valid index into their
//! track list.
//!
//! # Saved state
//!
//! Only a reduced projection is written back to the catalog:
//!
//! ```json
//! {
//!     "shuffle": false,
//!     "repeat": 0,
//!     "currentSource": {"key": "al1", "currentPosition": 2},
//!     "station": {"key": "sr1", "currentPosition": 0, "tracks": ["t1", "t2", "t3"]}
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use veil::Redact;

use crate::error::{Error, Result};

/// A track reference inside a track list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TrackRef {
    pub key: String,
}

/// A list of tracks as nested in catalog objects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Tracks {
    #[serde(default)]
    pub items: Vec<TrackRef>,
}

/// A catalog object as returned by the API, before narrowing.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub key: String,

    /// Short type code, such as `t` for a track or `al` for an album.
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub tracks: Option<Tracks>,

    #[serde(default)]
    pub current_position: Option<usize>,
}

/// A single track source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    pub key: String,
    pub name: Option<String>,
}

/// An ordered source with a cursor: an album, playlist or station.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sequence {
    pub key: String,

    /// Catalog type code this sequence was narrowed from.
    pub kind: String,

    pub name: Option<String>,

    tracks: Vec<String>,
    position: usize,
}

impl Sequence {
    /// Creates a sequence positioned at its first track.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `tracks` is empty, because an empty
    /// sequence has no valid position.
    pub fn new(key: &str, kind: &str, tracks: Vec<String>) -> Result<Self> {
        if tracks.is_empty() {
            return Err(Error::invalid_argument(format!(
                "source {key} has no tracks"
            )));
        }

        Ok(Self {
            key: key.to_owned(),
            kind: kind.to_owned(),
            name: None,
            tracks,
            position: 0,
        })
    }

    #[must_use]
    pub fn tracks(&self) -> &[String] {
        &self.tracks
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Key of the track under the cursor.
    #[must_use]
    pub fn current(&self) -> &str {
        // `position` is kept in bounds by every mutator.
        &self.tracks[self.position]
    }

    /// Whether there is a track after the cursor.
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.position + 1 < self.tracks.len()
    }

    /// Moves the cursor to `position`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `position` is not an index into the track list.
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position >= self.tracks.len() {
            return Err(Error::out_of_range(format!(
                "position {position} out of range for {} with {} tracks",
                self.key,
                self.tracks.len()
            )));
        }

        self.position = position;
        Ok(())
    }

    /// Moves the cursor one track forward, if possible.
    pub fn advance(&mut self) -> bool {
        if self.has_next() {
            self.position += 1;
            true
        } else {
            false
        }
    }

    /// Moves the cursor one track back, if possible.
    pub fn retreat(&mut self) -> bool {
        if self.position > 0 {
            self.position -= 1;
            true
        } else {
            false
        }
    }

    /// Appends `track` to a rolling window of at most `window` tracks.
    ///
    /// When the window is full the oldest track is dropped and the cursor
    /// stays put, so it ends up on the track that followed it. Otherwise
    /// the window grows and the cursor moves onto the appended track.
    pub fn roll(&mut self, track: String, window: usize) {
        self.tracks.push(track);
        if self.tracks.len() > window {
            self.tracks.remove(0);
            self.position = self.position.min(self.tracks.len() - 1);
        } else {
            self.position = self.tracks.len() - 1;
        }
    }
}

/// A playable source, narrowed from a catalog [`Object`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Object")]
pub enum Source {
    Track(Track),
    Albumish(Sequence),
    Station(Sequence),
}

impl Source {
    /// Type codes of albums and playlists.
    pub const ALBUMISH_TYPES: [&'static str; 3] = ["a", "al", "p"];

    /// Type codes of stations.
    pub const STATION_TYPES: [&'static str; 6] = ["lr", "rr", "h", "e", "tr", "c"];

    /// Type code of single tracks.
    pub const TRACK_TYPE: &'static str = "t";

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Track(track) => &track.key,
            Self::Albumish(sequence) | Self::Station(sequence) => &sequence.key,
        }
    }

    /// Key of the track that playing this source would sound.
    #[must_use]
    pub fn current_track(&self) -> &str {
        match self {
            Self::Track(track) => &track.key,
            Self::Albumish(sequence) | Self::Station(sequence) => sequence.current(),
        }
    }

    /// Cursor position for positional kinds.
    #[must_use]
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::Track(_) => None,
            Self::Albumish(sequence) | Self::Station(sequence) => Some(sequence.position()),
        }
    }

    #[must_use]
    pub fn as_sequence_mut(&mut self) -> Option<&mut Sequence> {
        match self {
            Self::Track(_) => None,
            Self::Albumish(sequence) | Self::Station(sequence) => Some(sequence),
        }
    }

    /// The reduced projection that is persisted for this source.
    #[must_use]
    pub fn saved(&self) -> SavedSource {
        match self {
            Self::Track(track) => SavedSource {
                key: track.key.clone(),
                current_position: None,
                tracks: None,
            },
            Self::Albumish(sequence) => SavedSource {
                key: sequence.key.clone(),
                current_position: Some(sequence.position()),
                tracks: None,
            },
            Self::Station(sequence) => SavedSource {
                key: sequence.key.clone(),
                current_position: Some(sequence.position()),
                tracks: Some(sequence.tracks().to_vec()),
            },
        }
    }
}

impl TryFrom<Object> for Source {
    type Error = Error;

    fn try_from(object: Object) -> Result<Self> {
        let kind = object.kind.as_str();
        if kind == Self::TRACK_TYPE {
            return Ok(Self::Track(Track {
                key: object.key,
                name: object.name,
            }));
        }

        let is_albumish = Self::ALBUMISH_TYPES.contains(&kind);
        let is_station = Self::STATION_TYPES.contains(&kind);
        if !is_albumish && !is_station {
            return Err(Error::invalid_argument(format!(
                "source {} has unsupported type {kind}",
                object.key
            )));
        }

        let tracks = object
            .tracks
            .unwrap_or_default()
            .items
            .into_iter()
            .map(|track| track.key)
            .collect();
        let mut sequence = Sequence::new(&object.key, kind, tracks)?;
        sequence.name = object.name;

        let position = object.current_position.unwrap_or_default();
        if let Err(e) = sequence.set_position(position) {
            warn!("{e}; starting at the first track");
        }

        if is_albumish {
            Ok(Self::Albumish(sequence))
        } else {
            Ok(Self::Station(sequence))
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Track(track) => write!(f, "track {}", track.key),
            Self::Albumish(sequence) => write!(
                f,
                "{} {} at {}/{}",
                sequence.kind,
                sequence.key,
                sequence.position() + 1,
                sequence.tracks().len()
            ),
            Self::Station(sequence) => write!(
                f,
                "station {} at {} of {:?}",
                sequence.key,
                sequence.position(),
                sequence.tracks()
            ),
        }
    }
}

/// Playback state as stored by the catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// What is playing; `None` means playback is stopped.
    #[serde(default)]
    pub current_source: Option<Source>,

    /// The home station to fall back to when the current source runs out.
    #[serde(default)]
    pub station: Option<Source>,
}

impl PlayerState {
    #[must_use]
    pub fn saved(&self) -> SavedState {
        SavedState {
            shuffle: false,
            repeat: 0,
            current_source: self.current_source.as_ref().map(Source::saved),
            station: self.station.as_ref().map(Source::saved),
        }
    }
}

/// A pending queue entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct QueueEntry {
    pub key: String,
}

/// Queue as returned by the catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct QueuePage {
    #[serde(default)]
    pub data: Vec<QueueEntry>,
}

/// Player state and queue as fetched at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredState {
    #[serde(default)]
    pub player_state: PlayerState,

    #[serde(default)]
    pub queue: QueuePage,
}

/// Persisted projection of a [`Source`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSource {
    pub key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_position: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Vec<String>>,
}

/// Persisted projection of [`PlayerState`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedState {
    pub shuffle: bool,
    pub repeat: u8,
    pub current_source: Option<SavedSource>,
    pub station: Option<SavedSource>,
}

/// Where and what to stream for one track.
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    #[redact(partial)]
    pub surl: String,
    pub stream_host: String,
    pub stream_app: String,
}

/// Station continuation as returned by station generation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Generated {
    #[serde(default)]
    pub tracks: Tracks,
}

/// Where to find the pubsub service and how to authenticate to it.
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
pub struct PubSubInfo {
    pub servers: Vec<String>,

    #[redact]
    pub token: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn station(tracks: &[&str]) -> Sequence {
        Sequence::new(
            "sr1",
            "rr",
            tracks.iter().map(ToString::to_string).collect(),
        )
        .unwrap()
    }

    #[test]
    fn narrows_type_codes() {
        let album: Source = serde_json::from_value(json!({
            "key": "al1",
            "type": "al",
            "tracks": {"items": [{"key": "t1"}, {"key": "t2"}]},
            "currentPosition": 1,
        }))
        .unwrap();
        assert!(matches!(album, Source::Albumish(_)));
        assert_eq!(album.current_track(), "t2");

        let track: Source = serde_json::from_value(json!({"key": "t9", "type": "t"})).unwrap();
        assert_eq!(track, Source::Track(Track { key: "t9".into(), name: None }));
        assert_eq!(track.position(), None);

        let radio: Source = serde_json::from_value(json!({
            "key": "sr1",
            "type": "rr",
            "tracks": {"items": [{"key": "s1"}]},
        }))
        .unwrap();
        assert!(matches!(radio, Source::Station(_)));
        assert_eq!(radio.position(), Some(0));
    }

    #[test]
    fn rejects_unknown_types_and_empty_lists() {
        let object = Object {
            key: "x1".into(),
            kind: "zz".into(),
            name: None,
            tracks: None,
            current_position: None,
        };
        let err = Source::try_from(object.clone()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
        assert!(!err.is_fatal());

        let empty = Object {
            kind: "p".into(),
            ..object
        };
        assert!(Source::try_from(empty).is_err());
    }

    #[test]
    fn out_of_range_position_starts_at_first_track() {
        let album: Source = serde_json::from_value(json!({
            "key": "al1",
            "type": "a",
            "tracks": {"items": [{"key": "t1"}]},
            "currentPosition": 5,
        }))
        .unwrap();
        assert_eq!(album.position(), Some(0));
    }

    #[test]
    fn rolling_window_drops_oldest_when_full() {
        let mut window = station(&["s1", "s2", "s3"]);
        window.set_position(2).unwrap();
        window.roll("s4".into(), 3);
        assert_eq!(window.tracks(), ["s2", "s3", "s4"]);
        assert_eq!(window.current(), "s4");
    }

    #[test]
    fn rolling_window_grows_until_full() {
        let mut window = station(&["s1"]);
        window.roll("s2".into(), 3);
        assert_eq!(window.tracks(), ["s1", "s2"]);
        assert_eq!(window.current(), "s2");
    }

    #[test]
    fn cursor_stays_in_bounds() {
        let mut album = station(&["t1", "t2"]);
        assert!(!album.retreat());
        assert!(album.advance());
        assert!(!album.advance());
        assert_eq!(album.position(), 1);
        assert!(album.set_position(2).is_err());
        assert_eq!(album.position(), 1);
    }

    #[test]
    fn saved_projection_by_kind() {
        let state = PlayerState {
            current_source: Some(Source::Albumish(
                Sequence::new("al1", "al", vec!["t1".into(), "t2".into()]).unwrap(),
            )),
            station: Some(Source::Station(station(&["s1", "s2"]))),
        };

        let saved = serde_json::to_value(state.saved()).unwrap();
        assert_eq!(
            saved,
            json!({
                "shuffle": false,
                "repeat": 0,
                "currentSource": {"key": "al1", "currentPosition": 0},
                "station": {"key": "sr1", "currentPosition": 0, "tracks": ["s1", "s2"]},
            })
        );

        let stopped = serde_json::to_value(PlayerState::default().saved()).unwrap();
        assert_eq!(stopped["currentSource"], serde_json::Value::Null);
    }

    #[test]
    fn stored_state_tolerates_missing_fields() {
        let stored: StoredState = serde_json::from_value(json!({
            "playerState": {"currentSource": null},
            "queue": {"data": [{"key": "al2", "name": "ignored"}]},
        }))
        .unwrap();
        assert!(stored.player_state.current_source.is_none());
        assert!(stored.player_state.station.is_none());
        assert_eq!(stored.queue.data, [QueueEntry { key: "al2".into() }]);
    }
}
