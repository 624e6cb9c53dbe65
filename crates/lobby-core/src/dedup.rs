//! Cooldown gate that keeps a lingering face from flooding display screens.

use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Deduplicator {
    last_identity: Option<String>,
    last_announced: Option<Instant>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `identity` should be announced at `now`.
    ///
    /// Announces on the very first call, on any change of identity, and when
    /// strictly more than `cooldown` has passed since the last announcement.
    /// A `true` answer records `identity` and `now` as the new last announcement.
    pub fn should_announce(&mut self, identity: &str, now: Instant, cooldown: Duration) -> bool {
        let announce = match (&self.last_identity, self.last_announced) {
            (Some(last), Some(at)) => {
                last != identity || now.saturating_duration_since(at) > cooldown
            }
            _ => true,
        };

        if announce {
            self.last_identity = Some(identity.to_string());
            self.last_announced = Some(now);
        }
        announce
    }

    pub fn reset(&mut self) {
        self.last_identity = None;
        self.last_announced = None;
    }

    pub fn last_identity(&self) -> Option<&str> {
        self.last_identity.as_deref()
    }
}
