//! Process-wide platform context.
//!
//! Everything the layer keeps globally sits in one [`Platform`], installed
//! once per process: the configuration, the bootstrap semaphore with the
//! thread registry and lock-order diagnostic list it guards, the slot-store
//! backend and the semaphore statistics registry.
//!
//! [`Platform::install`] fixes the configuration explicitly. Anything that
//! needs the platform before that calls [`Platform::get`], which installs the
//! configuration from the environment.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::config::{ConfigError, PlatformConfig, TlsStrategy};
use crate::fatal;
use crate::lockorder::OrderLink;
use crate::sem::{Sem, SemMutex, SemMutexGuard, SemStatSnapshot, SemStatsRegistry};
use crate::thread::{StackRangeTls, ThreadInfo};

static PLATFORM: OnceLock<Platform> = OnceLock::new();

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform already installed")]
    AlreadyInstalled,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What the running target supports.
#[derive(Debug, Clone, Copy)]
pub struct PlatformCaps;

impl PlatformCaps {
    /// Suspending and resuming another thread.
    pub const SUSPEND: bool = false;
    /// Cross-process named semaphores.
    pub const NAMED_SEMAPHORES: bool = cfg!(unix);
}

/// State guarded by the bootstrap semaphore.
#[derive(Debug, Default)]
pub(crate) struct Bootstrap {
    pub(crate) threads: Vec<ThreadInfo>,
    pub(crate) order_stacks: Vec<OrderLink>,
}

pub(crate) enum TlsBackend {
    Native,
    StackRange(StackRangeTls),
}

pub struct Platform {
    config: PlatformConfig,
    bootstrap: SemMutex<Bootstrap>,
    tls: TlsBackend,
    stats: SemStatsRegistry,
    live: AtomicUsize,
}

impl Platform {
    fn new(config: PlatformConfig) -> Self {
        let tls = match config.tls {
            TlsStrategy::Native => TlsBackend::Native,
            TlsStrategy::StackRange => TlsBackend::StackRange(StackRangeTls::new()),
        };
        Self {
            config,
            bootstrap: SemMutex::with_sem(Sem::bootstrap(), Bootstrap::default()),
            tls,
            stats: SemStatsRegistry::new(),
            live: AtomicUsize::new(0),
        }
    }

    /// Install `config` for the rest of the process.
    pub fn install(config: PlatformConfig) -> Result<&'static Platform, PlatformError> {
        let mut installed = false;
        let platform = PLATFORM.get_or_init(|| {
            installed = true;
            Self::new(config)
        });
        if !installed {
            return Err(PlatformError::AlreadyInstalled);
        }
        platform.announce();
        Ok(platform)
    }

    /// Install the configuration read from `OSSYNC_*` variables.
    pub fn install_from_env() -> Result<&'static Platform, PlatformError> {
        Self::install(PlatformConfig::from_env()?)
    }

    /// The installed platform, installing the environment configuration
    /// (or the defaults, if it is malformed) on first use.
    pub fn get() -> &'static Platform {
        if let Some(platform) = PLATFORM.get() {
            return platform;
        }
        let mut installed = false;
        let platform = PLATFORM.get_or_init(|| {
            installed = true;
            let config = PlatformConfig::from_env().unwrap_or_else(|err| {
                tracing::warn!(%err, "ignoring malformed platform configuration");
                PlatformConfig::default()
            });
            Self::new(config)
        });
        if installed {
            platform.announce();
        }
        platform
    }

    /// Installed platform without installing one.
    #[must_use]
    pub fn try_get() -> Option<&'static Platform> {
        PLATFORM.get()
    }

    fn announce(&self) {
        fatal::set_policy(self.config.fatal_policy);
        tracing::debug!(
            instrument = ?self.config.instrument,
            fatal_policy = ?self.config.fatal_policy,
            tls = ?self.config.tls,
            default_stack_size = self.config.default_stack_size,
            "platform installed"
        );
    }

    #[must_use]
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> &SemStatsRegistry {
        &self.stats
    }

    /// Per-number statistics of instrumented semaphores.
    #[must_use]
    pub fn sem_stats(&self) -> Vec<SemStatSnapshot> {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    #[track_caller]
    pub(crate) fn bootstrap(&self) -> SemMutexGuard<'_, Bootstrap> {
        self.bootstrap.lock()
    }

    pub(crate) fn tls_backend(&self) -> &TlsBackend {
        &self.tls
    }

    pub(crate) fn thread_attached(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn thread_detached(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("config", &self.config)
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sem::SemNumber;

    #[test]
    fn get_is_stable_and_second_install_is_rejected() {
        let first = Platform::get();
        assert!(std::ptr::eq(first, Platform::get()));
        assert!(matches!(
            Platform::install(PlatformConfig::default()),
            Err(PlatformError::AlreadyInstalled)
        ));
        assert!(Platform::try_get().is_some());
    }

    #[test]
    fn bootstrap_sem_is_order_exempt() {
        let platform = Platform::get();
        assert_eq!(platform.bootstrap.sem().number(), SemNumber::BOOTSTRAP);
        assert!(platform.bootstrap.sem().number().is_order_exempt());
        let boot = platform.bootstrap();
        drop(boot);
    }

    #[test]
    fn caps_reflect_std_targets() {
        assert!(!PlatformCaps::SUSPEND);
        assert_eq!(PlatformCaps::NAMED_SEMAPHORES, cfg!(unix));
    }
}
