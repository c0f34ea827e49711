//! Playback state machine.
//!
//! The [`Player`] owns the playback state of the account: the current
//! source with its cursor, the home station, the queue and whether this
//! process is master and audibly playing. It is driven by [`Event`]s that
//! its owner feeds it one at a time:
//!
//! * pubsub frames: subscriptions, master election and remote commands
//! * end-of-stream reports from the [`Sink`]
//! * results of catalog calls the player started earlier
//! * completions of state saves
//!
//! The player never waits on the network itself. Catalog calls run as
//! spawned tasks that report back through the event queue. A result is
//! checked against the state when it arrives and dropped if a later
//! command has superseded what it was fetched for. Commands that arrive
//! while a catalog call is in flight are therefore handled right away and
//! may overtake it.
//!
//! # Master election
//!
//! On every `CONNECTED` the player subscribes to its four channels. If it
//! is not master yet, it announces itself on the `player` channel, becomes
//! master and starts playing. When another player announces itself, this
//! player stops its stream and reports that it was evicted.
//!
//! # Persistence
//!
//! Whenever playback moves or the queue changes, a reduced projection of
//! the state is saved to the catalog. Saves are written one at a time, in
//! the order they were made.

use std::{collections::HashMap, future::Future, ops::ControlFlow, sync::Arc};

use tokio::sync::mpsc;

use crate::{
    error::{Error, Result},
    gateway::Catalog,
    pipeline::{Generation, Sink},
    protocol::{
        self,
        catalog::{
            Object, PlayerState, QueueEntry, SavedState, Source, StoredState, StreamDescriptor,
            TrackRef,
        },
        pubsub::{self, ChannelName, Command, Inbound, MasterPlayer, Outbound, Topic},
    },
};

/// Input to [`Player::handle`].
#[derive(Debug)]
pub enum Event {
    Frame(Inbound),
    StreamEnded(Generation),
    Resolved(Resolution),
    Saved(Result<()>),
}

/// Result of a catalog call started by the player.
#[derive(Debug)]
pub struct Resolution(Pending);

#[derive(Debug)]
enum Pending {
    /// A source to play, with the index to start at.
    Source {
        key: String,
        index: Option<usize>,
        result: Result<HashMap<String, Object>>,
    },

    /// The queue head, to continue with after the current source ran out.
    QueueHead {
        cursor: Option<Cursor>,
        key: String,
        result: Result<HashMap<String, Object>>,
    },

    /// A station continuation.
    Refill {
        cursor: Cursor,
        window: Vec<String>,
        result: Result<Vec<TrackRef>>,
    },

    /// Where to stream the current track from.
    Stream {
        request: u64,
        track: String,
        result: Result<StreamDescriptor>,
    },
}

/// Identifies the playback position a catalog call was started from.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Cursor {
    key: String,
    position: Option<usize>,
}

/// Another player took over as master.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evicted {
    pub by: String,
}

/// A save of the reduced projection with the queue.
#[derive(Debug)]
struct Snapshot {
    state: SavedState,
    queue: Vec<QueueEntry>,
}

enum Advance {
    Moved,
    Exhausted,
    Refill { cursor: Cursor, exclude: Vec<String> },
}

pub struct Player {
    user_key: String,
    player_id: String,

    catalog: Arc<dyn Catalog>,
    sink: Box<dyn Sink>,

    events: mpsc::UnboundedSender<Event>,
    outbox: mpsc::UnboundedSender<Outbound>,
    saves: mpsc::UnboundedSender<Snapshot>,

    state: PlayerState,
    queue: Vec<QueueEntry>,

    is_master: bool,
    is_active: bool,

    /// Bumped on every playback request and stop; stream resolutions of
    /// older requests are dropped.
    playback_request: u64,
}

impl Player {
    /// Number of tracks a station keeps in its rolling window.
    pub const STATION_WINDOW: usize = 3;

    /// Creates a player that is neither master nor playing.
    ///
    /// Frames to publish are sent to `outbox`. Follow-up events, including
    /// catalog results, are sent to `events` and must be fed back to
    /// [`Player::handle`].
    ///
    /// Must be called from within a Tokio runtime: it spawns the task that
    /// writes state saves.
    #[must_use]
    pub fn new(
        user_key: &str,
        player_id: &str,
        catalog: Arc<dyn Catalog>,
        sink: Box<dyn Sink>,
        events: mpsc::UnboundedSender<Event>,
        outbox: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let (saves, mut snapshots) = mpsc::unbounded_channel::<Snapshot>();
        let writer = Arc::clone(&catalog);
        let done = events.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = snapshots.recv().await {
                let result = writer
                    .save_player_state(&snapshot.state, &snapshot.queue)
                    .await;
                if done.send(Event::Saved(result)).is_err() {
                    break;
                }
            }
        });

        Self {
            user_key: user_key.to_owned(),
            player_id: player_id.to_owned(),
            catalog,
            sink,
            events,
            outbox,
            saves,
            state: PlayerState::default(),
            queue: Vec::new(),
            is_master: false,
            is_active: false,
            playback_request: 0,
        }
    }

    /// Replaces the playback state with what the catalog stored.
    pub fn load(&mut self, stored: StoredState) {
        match &stored.player_state.current_source {
            Some(source) => info!("restored {source}"),
            None => info!("restored stopped player"),
        }
        self.state = stored.player_state;
        self.queue = stored.queue.data;
    }

    #[must_use]
    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    #[must_use]
    pub fn queue(&self) -> &[QueueEntry] {
        &self.queue
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        self.is_master
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Stops the stream without announcing anything, for shutdown.
    pub fn stop(&mut self) {
        self.playback_request += 1;
        self.sink.kill();
    }

    /// Handles one event.
    ///
    /// Breaks with [`Evicted`] when another player took over as master; the
    /// stream has been stopped by then.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be acted upon. Errors for
    /// which [`Error::is_fatal`] holds mean that the player should not
    /// continue; all others only abandon the current operation.
    pub fn handle(&mut self, event: Event) -> Result<ControlFlow<Evicted>> {
        match event {
            Event::Frame(frame) => return self.handle_frame(frame),
            Event::StreamEnded(generation) => {
                if self.sink.finish(generation) {
                    debug!("stream {generation} ended");
                    self.next_track();
                }
            }
            Event::Resolved(Resolution(pending)) => self.resolve(pending)?,
            Event::Saved(result) => {
                if let Err(e) = result {
                    error!("saving player state failed: {e}");
                }
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    fn handle_frame(&mut self, frame: Inbound) -> Result<ControlFlow<Evicted>> {
        let (channel, payload) = match frame {
            Inbound::Connected => {
                self.on_connected();
                return Ok(ControlFlow::Continue(()));
            }
            Inbound::Publish { channel, payload } => (channel, payload),
        };

        if channel.user != self.user_key {
            debug!("discarding frame for user {}", channel.user);
            return Ok(ControlFlow::Continue(()));
        }

        let event: pubsub::Event = protocol::json(&payload, &channel.to_string())?;
        match (channel.topic, event) {
            (Topic::Private, pubsub::Event::Remote { command }) => {
                let command = Command::parse(command)?;
                self.dispatch(command)?;
            }
            (Topic::Player, pubsub::Event::MasterQuery) => self.announce(),
            (Topic::Player, pubsub::Event::MasterPlayer(claim)) => {
                if claim.name != self.player_id {
                    info!("{} took over as master player", claim.name);
                    self.stop();
                    return Ok(ControlFlow::Break(Evicted { by: claim.name }));
                }
            }
            (topic, event) => debug!("ignoring {event:?} on {topic}"),
        }

        Ok(ControlFlow::Continue(()))
    }

    fn on_connected(&mut self) {
        info!("connected to pubsub");
        for topic in Topic::SUBSCRIPTIONS {
            self.send(Outbound::Subscribe(self.channel(topic)));
        }

        if !self.is_master {
            self.is_active = true;
            self.announce();
            self.is_master = true;
            info!("claimed master player as {}", self.player_id);
            self.play_current_track();
        }
    }

    fn channel(&self, topic: Topic) -> ChannelName {
        ChannelName::new(&self.user_key, topic)
    }

    fn send(&self, frame: Outbound) {
        if self.outbox.send(frame).is_err() {
            warn!("outbox closed; dropping frame");
        }
    }

    /// Publishes this player's master state on the `player` channel.
    fn announce(&self) {
        let announcement = pubsub::Event::MasterPlayer(MasterPlayer {
            name: self.player_id.clone(),
            play_state: u8::from(self.is_active),
            volume: 1.0,
        });

        match serde_json::to_string(&announcement) {
            Ok(payload) => self.send(Outbound::Publish(self.channel(Topic::Player), payload)),
            Err(e) => error!("failed to encode master state: {e}"),
        }
    }

    fn dispatch(&mut self, command: Command) -> Result<()> {
        info!("remote command: {command}");
        match command {
            Command::TogglePause => self.toggle_pause(),
            Command::Next => self.next_track(),
            Command::Previous => self.previous_track(),
            Command::PlaySource { key, index } => self.play_source(key, index),
            Command::PlayQueuedSource {
                queue_index,
                source_index,
            } => self.play_queued_source(queue_index, source_index)?,
            Command::QueueSource { key } => self.queue_source(key),
            Command::Set { key, value } => self.set(&key, &value)?,
        }

        Ok(())
    }

    fn toggle_pause(&mut self) {
        if self.is_active {
            self.stop_player();
        } else {
            self.is_active = true;
            self.announce();
            self.play_current_track();
        }
    }

    fn stop_player(&mut self) {
        self.is_active = false;
        self.announce();
        self.stop();
    }

    fn play_source(&mut self, key: String, index: Option<usize>) {
        if !self.is_active {
            self.is_active = true;
            self.announce();
        }

        // Reusing a loaded station keeps its window, so that it does not
        // repeat tracks that were just played.
        let loaded = [&self.state.current_source, &self.state.station]
            .into_iter()
            .flatten()
            .find(|source| source.key() == key)
            .cloned();

        match loaded {
            Some(source) => self.start_source(source, index),
            None => {
                let catalog = Arc::clone(&self.catalog);
                self.spawn(async move {
                    let result = catalog.get(&[key.clone()], &["tracks"]).await;
                    Pending::Source { key, index, result }
                });
            }
        }
    }

    /// Makes `source` current at `index` and plays it.
    fn start_source(&mut self, mut source: Source, index: Option<usize>) {
        match &mut source {
            Source::Albumish(album) => {
                if let Err(e) = album.set_position(index.unwrap_or_default()) {
                    error!("not playing: {e}");
                    return;
                }
            }
            Source::Station(station) => {
                let position = index.unwrap_or(station.position());
                if let Err(e) = station.set_position(position) {
                    error!("not playing: {e}");
                    return;
                }
                self.mirror_station(&source);
            }
            Source::Track(_) => {}
        }

        info!("playing {source}");
        self.state.current_source = Some(source);
        self.play_current_track();
    }

    /// Copies the window and position of `station` into the home station
    /// if it is the same station.
    fn mirror_station(&mut self, station: &Source) {
        if let Some(home) = self.state.station.as_mut() {
            if home.key() == station.key() {
                *home = station.clone();
            }
        }
    }

    fn play_queued_source(&mut self, queue_index: usize, source_index: Option<usize>) -> Result<()> {
        if queue_index >= self.queue.len() {
            return Err(Error::out_of_range(format!(
                "queue index {queue_index} out of range for queue of {}",
                self.queue.len()
            )));
        }

        let entry = self.queue.remove(queue_index);
        self.persist();
        self.play_source(entry.key, source_index);
        Ok(())
    }

    fn queue_source(&mut self, key: String) {
        self.queue.push(QueueEntry { key });
        self.persist();
    }

    fn set(&mut self, key: &str, value: &serde_json::Value) -> Result<()> {
        match key {
            "sourcePosition" => {
                let position = value
                    .as_u64()
                    .and_then(|position| usize::try_from(position).ok())
                    .ok_or_else(|| {
                        Error::invalid_argument(format!("invalid source position {value}"))
                    })?;

                let source = self
                    .state
                    .current_source
                    .as_mut()
                    .ok_or_else(|| Error::failed_precondition("no source to seek in"))?;
                let sequence = source.as_sequence_mut().ok_or_else(|| {
                    Error::failed_precondition("cannot seek in a single track")
                })?;
                sequence.set_position(position)?;

                let source = source.clone();
                if matches!(source, Source::Station(_)) {
                    self.mirror_station(&source);
                }
                self.play_current_track();
            }
            other => warn!("ignoring setting {other}"),
        }

        Ok(())
    }

    fn cursor(&self) -> Option<Cursor> {
        self.state.current_source.as_ref().map(|source| Cursor {
            key: source.key().to_owned(),
            position: source.position(),
        })
    }

    fn next_track(&mut self) {
        let advance = match self.state.current_source.as_mut() {
            None => {
                debug!("nothing to advance");
                return;
            }
            // A single track has nothing after it.
            Some(Source::Track(_)) => Advance::Exhausted,
            Some(Source::Albumish(album)) => {
                if album.advance() {
                    Advance::Moved
                } else {
                    Advance::Exhausted
                }
            }
            Some(Source::Station(station)) => {
                if station.position() < Self::STATION_WINDOW - 1 && station.advance() {
                    Advance::Moved
                } else {
                    Advance::Refill {
                        cursor: Cursor {
                            key: station.key.clone(),
                            position: Some(station.position()),
                        },
                        exclude: station.tracks().to_vec(),
                    }
                }
            }
        };

        match advance {
            Advance::Moved => {
                if let Some(source @ Source::Station(_)) = self.state.current_source.clone() {
                    self.mirror_station(&source);
                }
                self.play_current_track();
            }
            Advance::Exhausted => self.end_of_source(),
            Advance::Refill { cursor, exclude } => {
                let catalog = Arc::clone(&self.catalog);
                self.spawn(async move {
                    let result = catalog.generate_station(&cursor.key, &exclude).await;
                    Pending::Refill {
                        cursor,
                        window: exclude,
                        result,
                    }
                });
            }
        }
    }

    /// Continues with the queue or the home station, or stops.
    fn end_of_source(&mut self) {
        if let Some(head) = self.queue.first() {
            let key = head.key.clone();
            let cursor = self.cursor();
            let catalog = Arc::clone(&self.catalog);
            self.spawn(async move {
                let result = catalog.get(&[key.clone()], &["tracks"]).await;
                Pending::QueueHead {
                    cursor,
                    key,
                    result,
                }
            });
        } else if let Some(station) = self.state.station.clone() {
            info!("continuing with {station}");
            self.state.current_source = Some(station);
            self.play_current_track();
        } else {
            info!("out of things to play");
            self.stop_player();
            self.state.current_source = None;
            self.persist();
        }
    }

    fn previous_track(&mut self) {
        let moved = match self.state.current_source.as_mut() {
            None => {
                debug!("nothing to retreat");
                return;
            }
            // There is no history to go back to.
            Some(Source::Track(_)) => false,
            Some(Source::Albumish(sequence) | Source::Station(sequence)) => sequence.retreat(),
        };

        if moved {
            if let Some(source @ Source::Station(_)) = self.state.current_source.clone() {
                self.mirror_station(&source);
            }
            self.play_current_track();
        } else {
            self.stop_player();
        }
    }

    /// Saves state and resolves the current track into a stream.
    fn play_current_track(&mut self) {
        if !self.is_master {
            return;
        }

        let Some(track) = self
            .state
            .current_source
            .as_ref()
            .map(|source| source.current_track().to_owned())
        else {
            debug!("no source to play");
            return;
        };

        self.persist();

        self.playback_request += 1;
        let request = self.playback_request;
        let catalog = Arc::clone(&self.catalog);
        self.spawn(async move {
            let result = catalog.get_playback_info(&track).await;
            Pending::Stream {
                request,
                track,
                result,
            }
        });
    }

    fn persist(&self) {
        let snapshot = Snapshot {
            state: self.state.saved(),
            queue: self.queue.clone(),
        };
        trace!("saving {snapshot:?}");
        if self.saves.send(snapshot).is_err() {
            error!("state writer is gone; not saving");
        }
    }

    /// Runs a catalog call and feeds its result back as an event.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = Pending> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let pending = future.await;
            let _ = events.send(Event::Resolved(Resolution(pending)));
        });
    }

    fn resolve(&mut self, pending: Pending) -> Result<()> {
        match pending {
            Pending::Source { key, index, result } => {
                let source = Self::take_source(result?, &key)?;
                self.start_source(source, index);
            }

            Pending::QueueHead {
                cursor,
                key,
                result,
            } => {
                if self.cursor() != cursor {
                    debug!("dropping queue head {key}: playback moved on");
                    return Ok(());
                }

                let mut source = Self::take_source(result?, &key)?;
                if self.queue.first().is_some_and(|head| head.key == key) {
                    self.queue.remove(0);
                }
                if let Some(sequence) = source.as_sequence_mut() {
                    sequence.set_position(0)?;
                }

                info!("continuing with {source}");
                self.state.current_source = Some(source);
                self.play_current_track();
            }

            Pending::Refill {
                cursor,
                window,
                result,
            } => {
                let track = result?
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::not_found(format!("station {} ran dry", cursor.key)))?;

                if self.cursor().as_ref() != Some(&cursor) {
                    debug!("dropping continuation of {}: playback moved on", cursor.key);
                    return Ok(());
                }
                let Some(Source::Station(station)) = self.state.current_source.as_mut() else {
                    return Ok(());
                };
                if station.tracks() != window.as_slice() {
                    debug!("dropping continuation of {}: window changed", cursor.key);
                    return Ok(());
                }

                station.roll(track.key, Self::STATION_WINDOW);
                if let Some(source) = self.state.current_source.clone() {
                    self.mirror_station(&source);
                }
                self.play_current_track();
            }

            Pending::Stream {
                request,
                track,
                result,
            } => {
                if request != self.playback_request || !self.is_master {
                    debug!("dropping stream of {track}: superseded");
                    return Ok(());
                }

                let stream = result?;
                match self.sink.play(&stream) {
                    Ok(generation) => info!("playing {track} as stream {generation}"),
                    Err(e) => {
                        error!("{e}; skipping {track}");
                        self.next_track();
                    }
                }
            }
        }

        Ok(())
    }

    fn take_source(mut objects: HashMap<String, Object>, key: &str) -> Result<Source> {
        let object = objects
            .remove(key)
            .ok_or_else(|| Error::not_found(format!("catalog has no {key}")))?;
        Source::try_from(object)
    }
}
