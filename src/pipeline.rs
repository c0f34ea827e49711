//! Two-stage playback of resolved streams.
//!
//! A [`Pipeline`] spawns a fetch process that writes the stream to its
//! stdout, and a playback process that reads it from its stdin:
//!
//! ```text
//! rtmpdump -q -r rtmpe://{host}{app} -y mp3:{surl} -o -  |  mplayer -cache 2048 -quiet -
//! ```
//!
//! At most one chain runs at a time. Each call to [`Sink::play`] returns a
//! fresh [`Generation`]. When the playback stage exits on its own, the
//! `on_ended` callback fires with the generation it was started under, and
//! the owner confirms with [`Sink::finish`] that the report is about the
//! live chain before advancing. Reports of chains that were killed or
//! superseded in the meantime are refused.

use std::{
    fmt,
    process::Stdio,
    sync::Arc,
};

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    protocol::catalog::StreamDescriptor,
};

/// Identifies one playback attempt.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    #[must_use]
    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callback fired when a chain ends by itself.
pub type OnEnded = Arc<dyn Fn(Generation) + Send + Sync>;

/// Destination for resolved streams.
pub trait Sink: Send {
    /// Stops whatever is playing and starts `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if either stage cannot be started. Nothing is left
    /// running in that case.
    fn play(&mut self, stream: &StreamDescriptor) -> Result<Generation>;

    /// Stops whatever is playing. Does nothing if nothing is.
    fn kill(&mut self);

    /// Accepts an end-of-stream report.
    ///
    /// Returns `true` exactly once for the live generation, and `false` for
    /// stale or repeated reports.
    fn finish(&mut self, generation: Generation) -> bool;
}

pub struct Pipeline {
    fetch_command: Vec<String>,
    play_command: Vec<String>,
    on_ended: OnEnded,

    generation: Generation,
    live: Option<CancellationToken>,
}

impl Pipeline {
    #[must_use]
    pub fn new(fetch_command: Vec<String>, play_command: Vec<String>, on_ended: OnEnded) -> Self {
        Self {
            fetch_command,
            play_command,
            on_ended,
            generation: Generation::default(),
            live: None,
        }
    }

    /// Substitutes stream placeholders in a command template.
    fn render(template: &[String], stream: &StreamDescriptor) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                arg.replace("{host}", &stream.stream_host)
                    .replace("{app}", &stream.stream_app)
                    .replace("{surl}", &stream.surl)
            })
            .collect()
    }

    fn command(argv: &[String]) -> Result<(&str, Command)> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::invalid_argument("command should not be empty"))?;

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        Ok((program, command))
    }

    fn spawn(&self, stream: &StreamDescriptor) -> Result<(Child, Child)> {
        let fetch_argv = Self::render(&self.fetch_command, stream);
        let (program, mut command) = Self::command(&fetch_argv)?;
        let mut fetch = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::pipeline_start(program, e))?;

        let stdout: Stdio = fetch
            .stdout
            .take()
            .ok_or_else(|| Error::internal("fetch stage has no stdout"))?
            .try_into()?;

        let play_argv = Self::render(&self.play_command, stream);
        let spawned = Self::command(&play_argv).and_then(|(program, mut command)| {
            command
                .stdin(stdout)
                .spawn()
                .map_err(|e| Error::pipeline_start(program, e))
        });

        match spawned {
            Ok(play) => Ok((fetch, play)),
            Err(e) => {
                if let Err(e) = fetch.start_kill() {
                    debug!("failed to kill fetch stage: {e}");
                }
                Err(e)
            }
        }
    }
}

impl Sink for Pipeline {
    fn play(&mut self, stream: &StreamDescriptor) -> Result<Generation> {
        self.kill();

        let (mut fetch, mut play) = self.spawn(stream)?;
        self.generation = self.generation.next();
        let generation = self.generation;

        let token = CancellationToken::new();
        self.live = Some(token.clone());

        let on_ended = Arc::clone(&self.on_ended);
        tokio::spawn(async move {
            tokio::select! {
                status = play.wait() => {
                    match status {
                        Ok(status) => debug!("stream {generation} ended: {status}"),
                        Err(e) => warn!("stream {generation} ended: {e}"),
                    }

                    // The fetch stage may still be buffering ahead.
                    if let Err(e) = fetch.kill().await {
                        trace!("fetch stage of {generation} already gone: {e}");
                    }
                    on_ended(generation);
                }
                () = token.cancelled() => {
                    trace!("killing stream {generation}");
                    let _ = play.kill().await;
                    let _ = fetch.kill().await;
                }
            }
        });

        debug!("started stream {generation}");
        Ok(generation)
    }

    fn kill(&mut self) {
        if let Some(token) = self.live.take() {
            debug!("stopping stream {}", self.generation);
            token.cancel();
        }
    }

    fn finish(&mut self, generation: Generation) -> bool {
        if generation == self.generation && self.live.is_some() {
            self.live = None;
            true
        } else {
            trace!("ignoring end of stale stream {generation}");
            false
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.kill();
    }
}

/// A sink that only logs what it would play.
#[derive(Debug, Default)]
pub struct Mock {
    generation: Generation,
}

impl Sink for Mock {
    fn play(&mut self, stream: &StreamDescriptor) -> Result<Generation> {
        self.generation = self.generation.next();
        info!(
            "would play stream {} from {}{}: {:?}",
            self.generation, stream.stream_host, stream.stream_app, stream
        );
        Ok(self.generation)
    }

    fn kill(&mut self) {
        info!("would stop stream {}", self.generation);
    }

    fn finish(&mut self, _generation: Generation) -> bool {
        false
    }
}
