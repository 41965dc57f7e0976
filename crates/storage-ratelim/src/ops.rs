//! Bookkeeping for the throttled operations themselves.
//!
//! A caller brackets each piece of throttled I/O with
//! [`begin`](crate::TokenBucket::begin) and
//! [`record`](crate::TokenBucket::record).  The bucket keeps a few counters
//! per kind of operation, and feeds the recorded bytes to the auto-tuner.

use std::fmt;
use std::time::Duration;

use strum::{EnumCount, EnumIter};

/// The kind of operation that is consuming I/O budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, EnumCount, EnumIter, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum IoOp {
    /// Writing a memtable out to disk.
    Flush,
    /// Merging files in the background.
    Compaction,
    /// A foreground write on behalf of a user.
    UserWrite,
    /// Anything else.
    Other,
}

impl IoOp {
    /// Return the slot for this operation in a per-operation table.
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Identifies the engine instance that issued an operation.
///
/// The bucket never holds a reference to the engine itself; it only keeps
/// this handle so that logs can say who did what.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct EngineId(pub u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

impl From<u64> for EngineId {
    fn from(id: u64) -> Self {
        EngineId(id)
    }
}

/// A token returned by [`begin`](crate::TokenBucket::begin).
///
/// Pass it back to [`record`](crate::TokenBucket::record) once the
/// operation is done.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use = "an OpStart should be passed to TokenBucket::record"]
pub struct OpStart {
    /// What kind of operation this is.
    pub(crate) op: IoOp,
    /// Who started it.
    pub(crate) engine: EngineId,
    /// Clock reading when it started.
    pub(crate) begin_us: u64,
}

impl OpStart {
    /// Return the kind of operation this token is for.
    pub fn op(&self) -> IoOp {
        self.op
    }

    /// Return the engine that began this operation.
    pub fn engine(&self) -> EngineId {
        self.engine
    }

    /// Return the clock reading at which this operation began, in microseconds.
    pub fn begin_micros(&self) -> u64 {
        self.begin_us
    }
}

/// Counters for one kind of operation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct OpStats {
    /// Number of recorded operations.
    pub count: u64,
    /// Total bytes those operations reported.
    pub bytes: u64,
    /// Total time between `begin` and `record`.
    pub busy: Duration,
}

impl OpStats {
    /// Account for one finished operation.
    pub(crate) fn note(&mut self, bytes: u64, elapsed_us: u64) {
        self.count = self.count.saturating_add(1);
        self.bytes = self.bytes.saturating_add(bytes);
        self.busy = self.busy.saturating_add(Duration::from_micros(elapsed_us));
    }
}

/// A table of [`OpStats`], one slot per [`IoOp`].
#[derive(Clone, Debug, Default)]
pub(crate) struct OpTable([OpStats; IoOp::COUNT]);

impl OpTable {
    /// Return the counters for `op`.
    pub(crate) fn get(&self, op: IoOp) -> OpStats {
        self.0[op.index()]
    }

    /// Return a mutable reference to the counters for `op`.
    pub(crate) fn get_mut(&mut self, op: IoOp) -> &mut OpStats {
        &mut self.0[op.index()]
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn table_slots_are_distinct() {
        let mut t = OpTable::default();
        for (i, op) in IoOp::iter().enumerate() {
            t.get_mut(op).note(i as u64 * 10, 1_000);
        }
        for (i, op) in IoOp::iter().enumerate() {
            let s = t.get(op);
            assert_eq!(s.count, 1);
            assert_eq!(s.bytes, i as u64 * 10);
            assert_eq!(s.busy, Duration::from_millis(1));
        }
    }

    #[test]
    fn display() {
        assert_eq!(IoOp::UserWrite.to_string(), "user_write");
        assert_eq!(EngineId(3).to_string(), "engine#3");
    }
}
