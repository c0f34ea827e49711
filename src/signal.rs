//! Process signals that end or restart a session.
//!
//! | Signal | Effect |
//! |--------|--------|
//! | Ctrl-C (SIGINT) | stop playback and exit |
//! | SIGTERM | stop playback and exit |
//! | SIGHUP | stop playback, re-read the secrets file and reconnect |
//!
//! Only Ctrl-C is available on platforms other than Unix.

use std::fmt;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Reload,
}

impl ShutdownSignal {
    /// Whether the process should exit rather than restart its session.
    #[must_use]
    pub fn is_exit(self) -> bool {
        matches!(self, Self::Interrupt | Self::Terminate)
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "Ctrl+C"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Reload => write!(f, "SIGHUP"),
        }
    }
}

pub struct Handler {
    #[cfg(unix)]
    sigterm: Signal,
    #[cfg(unix)]
    sighup: Signal,
}

impl Handler {
    /// Registers the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be registered.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
                _ = self.sigterm.recv() => ShutdownSignal::Terminate,
                _ = self.sighup.recv() => ShutdownSignal::Reload,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            ShutdownSignal::Interrupt
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_reload_restarts() {
        assert!(ShutdownSignal::Interrupt.is_exit());
        assert!(ShutdownSignal::Terminate.is_exit());
        assert!(!ShutdownSignal::Reload.is_exit());
        assert_eq!(ShutdownSignal::Reload.to_string(), "SIGHUP");
    }
}
