//! Build id allocation.
//!
//! A build id packs, from the most significant bit down:
//!
//! ```text
//! 0 | 43 bits: inverted ms since 2010-01-01 | 16 bits: suffix | 4 bits: version
//! ```
//!
//! Inverting the timestamp makes newer builds sort first in ascending order.

use chrono::{DateTime, TimeZone, Utc};
use kiln_core::{BuildId, Error, Result};
use rand::Rng;

const TIME_BITS: u32 = 43;
const SUFFIX_BITS: u32 = 16;
const VERSION_BITS: u32 = 4;
const ID_VERSION: i64 = 1;

const TIME_MASK: i64 = (1 << TIME_BITS) - 1;

/// Largest number of ids one call can hand out.
pub const MAX_BATCH: usize = 1 << SUFFIX_BITS;

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct IdAllocator;

impl IdAllocator {
    /// Returns `n` distinct ids for builds created at `now`.
    ///
    /// All ids share the timestamp; the suffixes are consecutive from a random
    /// start, wrapping at 2^16.
    pub fn allocate<R: Rng>(now: DateTime<Utc>, n: usize, rng: &mut R) -> Result<Vec<BuildId>> {
        if n > MAX_BATCH {
            return Err(Error::invalid(format!(
                "cannot allocate {n} build ids at once, the limit is {MAX_BATCH}"
            )));
        }
        let ms = (now - epoch()).num_milliseconds();
        if ms < 0 {
            return Err(Error::Internal(format!(
                "time {now} is before the build id epoch"
            )));
        }

        let prefix = (!ms & TIME_MASK) << (SUFFIX_BITS + VERSION_BITS);
        let start: u16 = rng.r#gen();
        let ids = (0..n)
            .map(|i| {
                let suffix = i64::from(start.wrapping_add(i as u16));
                BuildId::new(prefix | suffix << VERSION_BITS | ID_VERSION)
            })
            .collect();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    fn at(ms: i64) -> DateTime<Utc> {
        epoch() + chrono::Duration::milliseconds(ms)
    }

    fn creation_time(id: BuildId) -> DateTime<Utc> {
        at(!(id.get() >> (SUFFIX_BITS + VERSION_BITS)) & TIME_MASK)
    }

    #[test]
    fn test_batch_ids_are_distinct() {
        let mut rng = StdRng::seed_from_u64(1);
        let ids = IdAllocator::allocate(Utc::now(), 1000, &mut rng).unwrap();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 1000);
        assert!(ids.iter().all(|id| id.get() > 0 && id.get() & 0xF == 1));
    }

    #[test]
    fn test_newer_builds_have_smaller_ids() {
        let mut rng = StdRng::seed_from_u64(2);
        let older = IdAllocator::allocate(at(1_000), 1, &mut rng).unwrap()[0];
        let newer = IdAllocator::allocate(at(2_000), 1, &mut rng).unwrap()[0];
        assert!(newer < older);
    }

    #[test]
    fn test_creation_time_round_trip() {
        let mut rng = StdRng::seed_from_u64(3);
        let now = at(123_456_789);
        let id = IdAllocator::allocate(now, 1, &mut rng).unwrap()[0];
        assert_eq!(creation_time(id), now);
    }

    #[test]
    fn test_full_suffix_space() {
        let mut rng = StdRng::seed_from_u64(4);
        let ids = IdAllocator::allocate(Utc::now(), MAX_BATCH, &mut rng).unwrap();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), MAX_BATCH);
        assert!(IdAllocator::allocate(Utc::now(), MAX_BATCH + 1, &mut rng).is_err());
    }

    #[test]
    fn test_rejects_time_before_epoch() {
        let mut rng = StdRng::seed_from_u64(5);
        assert!(IdAllocator::allocate(at(-1), 1, &mut rng).is_err());
        assert!(IdAllocator::allocate(Utc::now(), 0, &mut rng).unwrap().is_empty());
    }
}
