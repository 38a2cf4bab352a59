//! Device entity and the presence state machine.
//!
//! A [`Device`] is a plain state holder owned by exactly one probe. The probe
//! feeds it check results through [`Device::observe`], which decides whether
//! the result is an edge worth reporting:
//!
//! - `None` (inconclusive) changes nothing.
//! - A definite result equal to the current state only refreshes timestamps.
//! - A definite result that differs from `Online`/`Offline` flips the state
//!   and yields exactly one [`Transition`].
//! - The first definite result after `Unknown` establishes a baseline. It is
//!   reported when the transport announces initial readings, or when it
//!   contradicts the device's expected initial state.

use chrono::{DateTime, Duration, Utc};

use crate::types::{Presence, Transition};

/// How a transport treats a device's first definite reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitialReport {
    /// Report every first reading, expected or not.
    pub announce: bool,
}

impl InitialReport {
    /// Report every first reading.
    pub const ANNOUNCE: Self = Self { announce: true };
    /// Report a first reading only when it contradicts the expectation.
    pub const ANOMALIES: Self = Self { announce: false };
}

/// A device tracked by one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device<I> {
    key: String,
    presence: Presence,
    expected: Option<Presence>,
    last_seen: Option<DateTime<Utc>>,
    last_checked: Option<DateTime<Utc>>,
    identity: I,
}

impl<I> Device<I> {
    /// Create a device in the `Unknown` state.
    pub fn new(key: impl Into<String>, identity: I) -> Self {
        Self {
            key: key.into(),
            presence: Presence::Unknown,
            expected: None,
            last_seen: None,
            last_checked: None,
            identity,
        }
    }

    /// Set the state the operator expects the first reading to confirm.
    #[must_use]
    pub fn with_expected(mut self, expected: Option<Presence>) -> Self {
        self.expected = expected;
        self
    }

    /// Registry key (configured name, or the raw identity for anonymous devices).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current presence state.
    pub const fn presence(&self) -> Presence {
        self.presence
    }

    /// Expected initial presence, if configured.
    pub const fn expected(&self) -> Option<Presence> {
        self.expected
    }

    /// When the device was last found online.
    pub const fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// When the device last produced a definite reading.
    pub const fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.last_checked
    }

    /// Transport-specific identity.
    pub const fn identity(&self) -> &I {
        &self.identity
    }

    /// Mutable access to the transport-specific identity.
    pub fn identity_mut(&mut self) -> &mut I {
        &mut self.identity
    }

    /// Time since the device was last seen online.
    ///
    /// A device that has never been seen is as old as it can get.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        self.last_seen
            .map_or(Duration::MAX, |seen| now.signed_duration_since(seen))
    }

    /// Refresh the last-seen timestamp without touching the state.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = Some(now);
    }

    /// Apply one check result and return the edge to report, if any.
    pub fn observe(
        &mut self,
        reading: Option<bool>,
        now: DateTime<Utc>,
        policy: InitialReport,
    ) -> Option<Transition> {
        let online = reading?;
        let next = Presence::from_reading(online);

        self.last_checked = Some(now);
        if online {
            self.last_seen = Some(now);
        }

        let previous = self.presence;
        if previous == next {
            return None;
        }
        self.presence = next;

        let report = match previous {
            Presence::Unknown => {
                policy.announce || self.expected.is_some_and(|expected| expected != next)
            }
            Presence::Online | Presence::Offline => true,
        };

        report.then_some(if online {
            Transition::New
        } else {
            Transition::Off
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device<()> {
        Device::new("phone", ()).with_expected(Some(Presence::Online))
    }

    /// Replays readings the slow way: one transition per definite change
    /// between `Online` and `Offline`.
    fn oracle(readings: &[Option<bool>]) -> usize {
        let mut state: Option<bool> = None;
        let mut transitions = 0;
        for reading in readings.iter().flatten() {
            if let Some(current) = state {
                if current != *reading {
                    transitions += 1;
                }
            }
            state = Some(*reading);
        }
        transitions
    }

    #[test]
    fn test_ping_sequence_fires_two_transitions() {
        let mut dev = device();
        let now = Utc::now();
        let readings = [true, true, false, false, true];
        let fired: Vec<(usize, Transition)> = readings
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                dev.observe(Some(*r), now, InitialReport::ANOMALIES)
                    .map(|t| (i + 1, t))
            })
            .collect();
        assert_eq!(fired, vec![(3, Transition::Off), (5, Transition::New)]);
    }

    #[test]
    fn test_inconclusive_reading_changes_nothing() {
        let mut dev = device();
        let now = Utc::now();
        assert_eq!(dev.observe(None, now, InitialReport::ANNOUNCE), None);
        assert_eq!(dev.presence(), Presence::Unknown);
        assert_eq!(dev.last_checked(), None);

        dev.observe(Some(true), now, InitialReport::ANOMALIES);
        assert_eq!(dev.observe(None, now, InitialReport::ANOMALIES), None);
        assert_eq!(dev.presence(), Presence::Online);
    }

    #[test]
    fn test_transitions_match_oracle() {
        let sequences: [&[Option<bool>]; 4] = [
            &[Some(true), None, Some(true), Some(false), None, Some(false)],
            &[Some(false), Some(true), Some(false), Some(true)],
            &[None, None, Some(true)],
            &[Some(true), Some(true), Some(true)],
        ];
        for readings in sequences {
            let mut dev = Device::new("d", ());
            let now = Utc::now();
            let fired = readings
                .iter()
                .filter_map(|r| dev.observe(*r, now, InitialReport::ANOMALIES))
                .count();
            assert_eq!(fired, oracle(readings), "readings: {readings:?}");
        }
    }

    #[test]
    fn test_unexpected_first_reading_is_reported() {
        let mut dev = device();
        let fired = dev.observe(Some(false), Utc::now(), InitialReport::ANOMALIES);
        assert_eq!(fired, Some(Transition::Off));
    }

    #[test]
    fn test_expected_first_reading_is_silent() {
        let mut dev = device();
        assert_eq!(dev.observe(Some(true), Utc::now(), InitialReport::ANOMALIES), None);
        assert_eq!(dev.presence(), Presence::Online);
    }

    #[test]
    fn test_announce_reports_first_reading() {
        let mut dev = Device::new("d", ());
        let fired = dev.observe(Some(true), Utc::now(), InitialReport::ANNOUNCE);
        assert_eq!(fired, Some(Transition::New));
    }

    #[test]
    fn test_offline_reading_keeps_last_seen() {
        let mut dev = device();
        let seen = Utc::now();
        dev.observe(Some(true), seen, InitialReport::ANOMALIES);
        let later = seen + Duration::seconds(30);
        dev.observe(Some(false), later, InitialReport::ANOMALIES);
        assert_eq!(dev.last_seen(), Some(seen));
        assert_eq!(dev.last_checked(), Some(later));
        assert_eq!(dev.age(later), Duration::seconds(30));
    }
}
