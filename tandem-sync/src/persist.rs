//! Debounced snapshot persistence state machine.
//!
//! The scheduler decides *when* to save; the Session driver does the I/O.
//!
//! ```text
//!  change ──▶ dirty, deadline = now + debounce ──▶ (quiet) ──▶ begin()
//!                ▲      (each change pushes it out)               │
//!                │                                        write in flight
//!                │                                                │
//!                └── change during flight: re-armed on complete ◀─┘
//! ```
//!
//! At most one write is in flight. A failed or conflicting write leaves the
//! scheduler dirty and re-armed one debounce later, never immediately.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SaveScheduler {
    debounce: Duration,
    deadline: Option<Instant>,
    dirty: bool,
    in_flight: bool,
    /// Version of the snapshot this Session last wrote or read
    persisted_version: u64,
}

impl SaveScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            deadline: None,
            dirty: false,
            in_flight: false,
            persisted_version: 0,
        }
    }

    /// Record a document change and (re)start the debounce window.
    ///
    /// While a write is in flight the window is armed only once it settles.
    pub fn note_change(&mut self, now: Instant) {
        self.dirty = true;
        if !self.in_flight {
            self.deadline = Some(now + self.debounce);
        }
    }

    /// When the next write should start, if one is due.
    pub fn deadline(&self) -> Option<Instant> {
        if self.in_flight {
            None
        } else {
            self.deadline
        }
    }

    /// Start a write. Returns the version the store is expected to hold, or
    /// `None` when there is nothing to write or a write is already running.
    pub fn begin(&mut self) -> Option<u64> {
        if self.in_flight || !self.dirty {
            self.deadline = None;
            return None;
        }
        self.deadline = None;
        self.dirty = false;
        self.in_flight = true;
        Some(self.persisted_version)
    }

    /// Write succeeded at `version`.
    pub fn complete(&mut self, version: u64, now: Instant) {
        self.in_flight = false;
        self.persisted_version = version;
        if self.dirty {
            self.deadline = Some(now + self.debounce);
        }
    }

    /// Write failed; keep the change and retry on the next trigger.
    pub fn fail(&mut self, now: Instant) {
        self.in_flight = false;
        self.dirty = true;
        self.deadline = Some(now + self.debounce);
    }

    /// Another writer got there first. Adopt its version and re-save on the
    /// next trigger; the in-memory document is authoritative.
    pub fn conflict(&mut self, current_version: u64, now: Instant) {
        self.persisted_version = current_version;
        self.fail(now);
    }

    /// Make any pending change due immediately.
    pub fn flush_now(&mut self, now: Instant) {
        if self.dirty && !self.in_flight {
            self.deadline = Some(now);
        }
    }

    /// Schedule an immediate write even without a document change, to
    /// overwrite a stored snapshot known to be bad.
    pub fn repair_now(&mut self, now: Instant) {
        self.dirty = true;
        if !self.in_flight {
            self.deadline = Some(now);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Nothing pending and nothing in flight.
    pub fn is_settled(&self) -> bool {
        !self.dirty && !self.in_flight
    }

    pub fn persisted_version(&self) -> u64 {
        self.persisted_version
    }

    pub fn set_persisted_version(&mut self, version: u64) {
        self.persisted_version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(100);

    #[test]
    fn test_burst_coalesces_into_one_deadline() {
        let t0 = Instant::now();
        let mut s = SaveScheduler::new(DEBOUNCE);

        for i in 0..10 {
            s.note_change(t0 + Duration::from_millis(i * 10));
        }

        assert_eq!(s.deadline(), Some(t0 + Duration::from_millis(90) + DEBOUNCE));
        assert_eq!(s.begin(), Some(0));
        assert_eq!(s.begin(), None);
    }

    #[test]
    fn test_clean_scheduler_has_nothing_to_do() {
        let mut s = SaveScheduler::new(DEBOUNCE);
        assert!(s.is_settled());
        assert_eq!(s.deadline(), None);
        assert_eq!(s.begin(), None);
    }

    #[test]
    fn test_change_during_flight_rearms_after_completion() {
        let t0 = Instant::now();
        let mut s = SaveScheduler::new(DEBOUNCE);
        s.note_change(t0);
        assert_eq!(s.begin(), Some(0));

        s.note_change(t0 + Duration::from_millis(5));
        assert_eq!(s.deadline(), None);

        let t1 = t0 + Duration::from_millis(20);
        s.complete(1, t1);
        assert_eq!(s.persisted_version(), 1);
        assert_eq!(s.deadline(), Some(t1 + DEBOUNCE));
        assert_eq!(s.begin(), Some(1));
    }

    #[test]
    fn test_failure_retries_on_next_trigger() {
        let t0 = Instant::now();
        let mut s = SaveScheduler::new(DEBOUNCE);
        s.note_change(t0);
        s.begin();

        let t1 = t0 + Duration::from_millis(30);
        s.fail(t1);
        assert!(s.is_dirty());
        assert_eq!(s.deadline(), Some(t1 + DEBOUNCE));
        assert_eq!(s.begin(), Some(0));
    }

    #[test]
    fn test_conflict_adopts_store_version() {
        let t0 = Instant::now();
        let mut s = SaveScheduler::new(DEBOUNCE);
        s.note_change(t0);
        s.begin();

        s.conflict(7, t0);
        assert_eq!(s.persisted_version(), 7);
        assert_eq!(s.begin(), Some(7));
        s.complete(8, t0);
        assert!(s.is_settled());
    }

    #[test]
    fn test_flush_and_repair() {
        let t0 = Instant::now();
        let mut s = SaveScheduler::new(DEBOUNCE);

        s.flush_now(t0);
        assert_eq!(s.deadline(), None);

        s.note_change(t0);
        s.flush_now(t0);
        assert_eq!(s.deadline(), Some(t0));

        s.begin();
        s.complete(1, t0);
        s.repair_now(t0);
        assert_eq!(s.deadline(), Some(t0));
        assert_eq!(s.begin(), Some(1));
    }
}
