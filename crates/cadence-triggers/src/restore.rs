use std::sync::Arc;

use cadence_marshal::{unmarshal_object, MarshalError, Marshaled, Restore};

use crate::combining::{AndTrigger, OrTrigger};
use crate::cron::CronTrigger;
use crate::date::DateTrigger;
use crate::interval::IntervalTrigger;
use crate::trigger::Trigger;

/// Type references of every trigger that can be restored from storage.
pub const TRIGGER_TYPES: [&str; 5] = [
    DateTrigger::TYPE_REF,
    IntervalTrigger::TYPE_REF,
    CronTrigger::TYPE_REF,
    AndTrigger::TYPE_REF,
    OrTrigger::TYPE_REF,
];

/// Rebuild a trigger from its marshaled form, switching on the type reference.
pub fn restore_trigger(marshaled: Marshaled) -> cadence_marshal::Result<Arc<dyn Trigger>> {
    let type_ref = marshaled.type_ref.clone();
    let trigger: Arc<dyn Trigger> = match type_ref.as_str() {
        t if t == DateTrigger::TYPE_REF => Arc::new(unmarshal_object::<DateTrigger>(marshaled)?),
        t if t == IntervalTrigger::TYPE_REF => {
            Arc::new(unmarshal_object::<IntervalTrigger>(marshaled)?)
        }
        t if t == CronTrigger::TYPE_REF => Arc::new(unmarshal_object::<CronTrigger>(marshaled)?),
        t if t == AndTrigger::TYPE_REF => Arc::new(unmarshal_object::<AndTrigger>(marshaled)?),
        t if t == OrTrigger::TYPE_REF => Arc::new(unmarshal_object::<OrTrigger>(marshaled)?),
        _ => return Err(MarshalError::UnsupportedType(marshaled.type_ref)),
    };
    Ok(trigger)
}
