//! Central semaphore number assignment.
//!
//! Numbers are partitioned by subsystem in blocks of 100. Within a thread,
//! semaphores must be acquired in non-decreasing number order (checked by
//! [`lockorder`](crate::lockorder) in debug builds), so a subsystem that calls
//! into another while holding its own lock needs the lower block. The timer
//! queue sits at the top because any subsystem may schedule a timeout while
//! holding its own locks.
//!
//! Adding a subsystem means reserving a fresh block here; the numbers are a
//! build-time contract between every module linked into the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fatal::{self, Fatal};

/// Diagnostic id of a semaphore. Not an identity key: several semaphores may
/// share a number (one per hash bucket, say) and are then ordered as equals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SemNumber(u32);

impl SemNumber {
    /// Disables ordering checks for the semaphore carrying it.
    pub const NO_CHECK: Self = Self(0);
    /// The one semaphore guarding thread registration and the lock-order
    /// diagnostic list. Exempt from ordering checks: the lock-order stack
    /// lives in thread-local storage whose lazy setup takes this semaphore.
    pub const BOOTSTRAP: Self = Self(1);
    /// Highest assignable number.
    pub const MAX: Self = Self(999);

    /// Validate a raw number. Anything outside the reserved space is fatal.
    #[track_caller]
    #[must_use]
    pub fn new(raw: u32) -> Self {
        if raw > Self::MAX.0 {
            fatal::raise(Fatal::InvalidSemNumber(raw));
        }
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// True for numbers the lock-order checker skips.
    #[must_use]
    pub const fn is_order_exempt(self) -> bool {
        self.0 == Self::NO_CHECK.0 || self.0 == Self::BOOTSTRAP.0
    }

    /// Subsystem block the number belongs to.
    #[must_use]
    pub fn subsystem(self) -> &'static str {
        RANGES
            .iter()
            .find(|(lo, hi, _)| (*lo..=*hi).contains(&self.0))
            .map_or("unassigned", |(_, _, name)| name)
    }

    /// Constant name for numbers declared in this module.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        NAMED
            .iter()
            .find(|(number, _)| *number == self)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for SemNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

const RANGES: &[(u32, u32, &str)] = &[
    (0, 99, "platform"),
    (100, 199, "catalog"),
    (200, 299, "transaction"),
    (300, 399, "lock-manager"),
    (400, 499, "cache"),
    (500, 599, "log"),
    (600, 699, "replication"),
    (700, 799, "rpc"),
    (800, 899, "user"),
    (900, 999, "timer"),
];

macro_rules! sem_numbers {
    ($($(#[$doc:meta])* $name:ident = $value:literal;)*) => {
        $(
            $(#[$doc])*
            pub const $name: SemNumber = SemNumber($value);
        )*

        const NAMED: &[(SemNumber, &str)] = &[
            (SemNumber::NO_CHECK, "NO_CHECK"),
            (SemNumber::BOOTSTRAP, "BOOTSTRAP"),
            $(($name, stringify!($name)),)*
        ];
    };
}

sem_numbers! {
    /// Named cross-process semaphore guarding engine startup.
    PLATFORM_STARTUP = 10;
    PLATFORM_ENV = 11;

    CATALOG_TABLE = 110;
    CATALOG_INDEX = 120;
    CATALOG_STATS = 130;

    TXN_TABLE = 210;
    TXN_COMMIT = 220;
    TXN_CHECKPOINT = 230;

    LOCK_TABLE = 310;
    LOCK_WAIT_GRAPH = 320;
    LOCK_DEADLOCK = 330;

    /// Cache LRU list. Numbered below [`CACHE_HASH`] yet may be taken while it
    /// is held: the single tolerated reverse pair.
    CACHE_LRU = 410;
    CACHE_HASH = 420;
    CACHE_FREELIST = 430;
    CACHE_FLUSH = 440;
    CACHE_PAGE = 450;

    LOG_BUFFER = 510;
    LOG_WRITER = 520;
    LOG_FLUSH = 530;
    LOG_ARCHIVE = 540;

    REPL_STATE = 610;
    REPL_SEND = 620;
    REPL_APPLY = 630;

    RPC_SESSION = 710;
    RPC_DISPATCH = 720;
    RPC_REPLY = 730;

    /// First number free for embedding applications and tests.
    USER_BASE = 800;

    /// Timer scheduler queue. Highest number: taken from within any subsystem.
    TIMER_QUEUE = 990;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_sentinels_are_order_exempt() {
        assert!(SemNumber::NO_CHECK.is_order_exempt());
        assert!(SemNumber::BOOTSTRAP.is_order_exempt());
        assert!(!CACHE_HASH.is_order_exempt());
    }

    #[test]
    fn whitelisted_pair_is_numbered_in_reverse() {
        assert!(CACHE_LRU < CACHE_HASH);
    }

    #[test]
    fn timer_queue_is_above_every_subsystem() {
        for (number, _) in NAMED {
            assert!(*number <= TIMER_QUEUE);
        }
    }

    #[test]
    fn names_and_subsystems_resolve() {
        assert_eq!(LOG_WRITER.name(), Some("LOG_WRITER"));
        assert_eq!(LOG_WRITER.subsystem(), "log");
        assert_eq!(SemNumber::new(855).subsystem(), "user");
        assert_eq!(SemNumber::new(855).name(), None);
        assert_eq!(LOCK_TABLE.to_string(), "LOCK_TABLE(310)");
        assert_eq!(SemNumber::new(42).to_string(), "42");
    }

    #[test]
    fn declared_numbers_are_unique() {
        let mut seen: Vec<u32> = NAMED.iter().map(|(n, _)| n.get()).collect();
        seen.sort_unstable();
        let before = seen.len();
        seen.dedup();
        assert_eq!(before, seen.len());
    }

    #[test]
    #[should_panic(expected = "outside the reserved id space")]
    fn out_of_range_number_is_fatal() {
        let _ = SemNumber::new(1_000);
    }
}
