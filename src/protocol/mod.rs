//! Wire types of the catalog API and the pubsub service.
//!
//! * [`catalog`] - catalog objects, player state and stream descriptors
//! * [`pubsub`] - pubsub frames, events and remote commands

pub mod catalog;
pub mod pubsub;

use crate::error::Result;
use serde::Deserialize;
use std::fmt::Debug;

/// Parses and logs a JSON document received from `origin`.
///
/// Successfully parsed documents are logged at TRACE level. Documents that
/// do not match `T` are logged at TRACE level as well; bodies that are not
/// JSON at all are logged as errors.
///
/// # Errors
///
/// Returns an error if `body` is not valid JSON or does not match `T`.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing ({e:?})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
