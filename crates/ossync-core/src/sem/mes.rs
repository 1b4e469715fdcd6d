//! Auto-reset event ("Mes").
//!
//! A posted event stays posted until exactly one waiter consumes it, so a
//! post that happens before the wait is never lost. Used for the timer
//! scheduler's wakeups and for thread-completion signaling.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// How long [`Mes::wait`] may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MesWait {
    Indefinite,
    Zero,
    For(Duration),
}

/// Result of [`Mes::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MesStatus {
    Posted,
    Timeout,
}

#[derive(Debug, Default)]
pub struct Mes {
    posted: Mutex<bool>,
    cond: Condvar,
}

impl Mes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking at most one waiter.
    pub fn post(&self) {
        let mut posted = self.posted.lock();
        *posted = true;
        self.cond.notify_one();
    }

    /// Clear a pending post without waking anybody.
    pub fn reset(&self) {
        *self.posted.lock() = false;
    }

    #[must_use]
    pub fn is_posted(&self) -> bool {
        *self.posted.lock()
    }

    /// Wait for a post and consume it.
    pub fn wait(&self, timeout: MesWait) -> MesStatus {
        let mut posted = self.posted.lock();
        match timeout {
            MesWait::Zero => {}
            MesWait::Indefinite => {
                while !*posted {
                    self.cond.wait(&mut posted);
                }
            }
            MesWait::For(duration) => {
                let deadline = Instant::now().checked_add(duration);
                while !*posted {
                    match deadline {
                        Some(deadline) => {
                            if self.cond.wait_until(&mut posted, deadline).timed_out() {
                                break;
                            }
                        }
                        None => self.cond.wait(&mut posted),
                    }
                }
            }
        }
        if *posted {
            *posted = false;
            MesStatus::Posted
        } else {
            MesStatus::Timeout
        }
    }
}
