use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

const MAX_SEQUENCE: u32 = 0x00ff_ffff;

/// Issues checkpoint ids whose lexicographic order is their creation order.
///
/// Layout: `{micros:016x}-{sequence:06x}-{random:08x}`. The sequence breaks
/// ties inside one microsecond (and absorbs a clock that steps backwards);
/// the random suffix keeps ids from separate processes apart.
#[derive(Debug, Default)]
pub struct CheckpointIdGenerator {
    last: Mutex<(u64, u32)>,
}

impl CheckpointIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id, strictly greater than both the previously issued id and
    /// `after` when `after` is an id in this format.
    pub fn next_id(&self, now: DateTime<Utc>, after: Option<&str>) -> String {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        let mut micros = u64::try_from(now.timestamp_micros()).unwrap_or_default();
        let mut sequence = 0;
        if micros <= last.0 {
            micros = last.0;
            sequence = last.1 + 1;
        }

        if let Some(floor) = after.and_then(parse_checkpoint_id) {
            if (micros, sequence) <= floor {
                micros = floor.0;
                sequence = floor.1 + 1;
            }
        }

        if sequence > MAX_SEQUENCE {
            micros += 1;
            sequence = 0;
        }

        *last = (micros, sequence);
        format!("{micros:016x}-{sequence:06x}-{:08x}", rand::random::<u32>())
    }
}

/// Time and sequence components of an id issued by [`CheckpointIdGenerator`].
pub fn parse_checkpoint_id(id: &str) -> Option<(u64, u32)> {
    let mut parts = id.split('-');
    let micros = parts.next().filter(|part| part.len() == 16)?;
    let sequence = parts.next().filter(|part| part.len() == 6)?;
    Some((
        u64::from_str_radix(micros, 16).ok()?,
        u32::from_str_radix(sequence, 16).ok()?,
    ))
}

/// Creation time encoded in a generated checkpoint id.
pub fn checkpoint_id_time(id: &str) -> Option<DateTime<Utc>> {
    let (micros, _) = parse_checkpoint_id(id)?;
    DateTime::from_timestamp_micros(i64::try_from(micros).ok()?)
}
