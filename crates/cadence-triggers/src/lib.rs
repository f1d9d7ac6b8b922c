//! `cadence-triggers`: fire-time computation for scheduled jobs.
//!
//! A [`Trigger`] answers one question: given the previous fire time (if any)
//! and the current time, when should the job run next?
//!
//! | Trigger             | Registry name | Fires                                            |
//! |---------------------|---------------|--------------------------------------------------|
//! | [`DateTrigger`]     | `date`        | once, at a fixed instant                          |
//! | [`IntervalTrigger`] | `interval`    | every period, on a grid anchored at `start_date`  |
//! | [`CronTrigger`]     | `cron`        | on instants whose calendar fields all match       |
//! | [`AndTrigger`]      | `and`         | when all sub-triggers agree                       |
//! | [`OrTrigger`]       | `or`          | whenever any sub-trigger fires                    |
//!
//! Built-in triggers marshal to a versioned state map and come back through
//! [`restore_trigger`].

pub mod combining;
pub mod cron;
pub mod date;
pub mod error;
pub mod interval;
pub mod registry;
pub mod restore;
pub mod time;
pub mod trigger;

pub use combining::{AndTrigger, OrTrigger};
pub use cron::{CronSpec, CronTrigger};
pub use date::DateTrigger;
pub use error::{Result, TriggerError};
pub use interval::IntervalTrigger;
pub use registry::{TriggerContext, TriggerFactory, TriggerRegistry};
pub use restore::{restore_trigger, TRIGGER_TYPES};
pub use trigger::Trigger;

pub use chrono_tz::Tz;
