//! Headless remote-controlled player.
//!
//! `remoteslave` joins the pubsub remote-control session of an account,
//! competes with the account's other clients to become the master player,
//! and plays what remote commands ask for through an external fetch and
//! playback process chain.
//!
//! # Architecture
//!
//! * [`pubsub`] - websocket channel to the pubsub service that reconnects
//!   by itself
//! * [`player`] - playback state machine: master election, remote commands,
//!   track advance across albums, playlists, stations and the queue
//! * [`pipeline`] - the fetch and playback processes of one stream
//! * [`gateway`] - catalog API: lookups, station generation, stream
//!   resolution and state persistence
//! * [`remote`] - one session wiring the above together
//!
//! Wire formats live in [`protocol`]; [`config`], [`session`] and [`error`]
//! hold the ambient types shared by all of them.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod pipeline;
pub mod player;
pub mod protocol;
pub mod pubsub;
pub mod remote;
pub mod session;
pub mod signal;
