//! Sliding-window accounting for one (resource key, dimension) pair.
//!
//! Entries are kept ordered by slot time. Every entry shares the same window,
//! so ordering by slot time is also ordering by expiry, which lets pruning pop
//! from the front and lets [`DimensionLedger::earliest_available`] walk the
//! entries once.
//!
//! An entry is live while `slot_time_ms + window_ms > now_ms`. Entries with a
//! slot time in the future are forward reservations: they count as used from
//! the moment they are written.

use std::collections::VecDeque;

use crate::RecordId;

/// One record's contribution to a dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Record the amount belongs to.
    pub record_id: RecordId,
    /// Amount charged against the dimension.
    pub amount: u64,
    /// Unix time, in milliseconds, at which the record is effective.
    pub slot_time_ms: u64,
}

/// Time-ordered ledger of a single dimension.
#[derive(Debug, Clone, Default)]
pub struct DimensionLedger {
    window_ms: u64,
    entries: VecDeque<LedgerEntry>,
    total: u64,
}

impl DimensionLedger {
    /// An empty ledger whose entries live for `window_ms`.
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            entries: VecDeque::new(),
            total: 0,
        }
    }

    /// Window length, in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Change the window length. Already written entries follow the new window.
    pub fn set_window_ms(&mut self, window_ms: u64) {
        self.window_ms = window_ms;
    }

    fn expiry(&self, entry: &LedgerEntry) -> u64 {
        entry.slot_time_ms.saturating_add(self.window_ms)
    }

    fn is_live(&self, entry: &LedgerEntry, now_ms: u64) -> bool {
        self.expiry(entry) > now_ms
    }

    /// Drop every entry with `slot_time + window <= now`.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let mut removed = 0;

        while let Some(entry) = self.entries.front()
            && !self.is_live(entry, now_ms)
        {
            let amount = entry.amount;
            self.entries.pop_front();
            self.total = self.total.saturating_sub(amount);
            removed += 1;
        }

        removed
    }

    /// Sum of live amounts at `now_ms`.
    ///
    /// Does not mutate the ledger, so it is safe on read-only paths. Constant
    /// time once the ledger has been pruned at `now_ms`.
    pub fn used(&self, now_ms: u64) -> u64 {
        match self.entries.front() {
            // expiry order: a live front means every entry is live
            Some(front) if !self.is_live(front, now_ms) => {
                self.live(now_ms).map(|e| e.amount).sum()
            }
            _ => self.total,
        }
    }

    /// Live entries at `now_ms`, ordered by slot time.
    pub fn live(&self, now_ms: u64) -> impl Iterator<Item = &LedgerEntry> {
        self.entries
            .iter()
            .filter(move |entry| self.is_live(entry, now_ms))
    }

    /// Earliest instant at which `needed` fits under `limit`.
    ///
    /// Returns `now_ms` if it fits already. Otherwise walks live entries in
    /// expiry order, accumulating what they release, and returns the expiry of
    /// the entry at which enough has been released. If even releasing every
    /// known entry is not enough, returns the expiry of the last one.
    pub fn earliest_available(&self, now_ms: u64, needed: u64, limit: u64) -> u64 {
        let used = self.used(now_ms);

        if used.saturating_add(needed) <= limit {
            return now_ms;
        }

        let mut released = 0u64;
        let mut last_expiry = now_ms;

        for entry in self.live(now_ms) {
            released = released.saturating_add(entry.amount);
            last_expiry = self.expiry(entry);

            if used.saturating_add(needed).saturating_sub(released) <= limit {
                return last_expiry;
            }
        }

        last_expiry
    }

    /// Add a record's contribution, keeping slot time order.
    ///
    /// Entries sharing a slot time keep insertion order.
    pub fn insert(&mut self, entry: LedgerEntry) {
        let index = self
            .entries
            .partition_point(|e| e.slot_time_ms <= entry.slot_time_ms);

        self.total = self.total.saturating_add(entry.amount);
        self.entries.insert(index, entry);
    }

    /// Replace a record's amount with `new_amount`.
    ///
    /// Returns the previous amount, or `None` if the record is not in the ledger.
    pub fn adjust_amount(&mut self, record_id: &RecordId, new_amount: u64) -> Option<u64> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| &e.record_id == record_id)?;

        let previous = std::mem::replace(&mut entry.amount, new_amount);
        self.total = self.total.saturating_sub(previous).saturating_add(new_amount);

        Some(previous)
    }

    /// Returns `true` if the record has an entry, live or not yet pruned.
    pub fn contains(&self, record_id: &RecordId) -> bool {
        self.entries.iter().any(|e| &e.record_id == record_id)
    }

    /// Running sum of every entry, including ones not pruned yet.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of entries, including ones not pruned yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the ledger holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
