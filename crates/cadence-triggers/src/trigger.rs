use std::fmt;

use cadence_marshal::Marshal;
use chrono::{DateTime, Utc};

/// Computes when a job should next run.
///
/// Implementations hold immutable configuration only: the same inputs must
/// always produce the same output. Triggers that never go to a persistent
/// store may keep the default [`Marshal`] impl.
pub trait Trigger: Marshal + Send + Sync + fmt::Debug + fmt::Display {
    /// Next instant after `previous` (or the first one at or after `now` when
    /// there is no previous fire time), or `None` once the trigger is done.
    fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;
}
