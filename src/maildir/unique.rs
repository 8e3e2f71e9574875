//! Unique file names for deliveries.
//!
//! Every delivery gets a token that is unique across processes, restarts and
//! hosts sharing the mailbox:
//!
//! ```text
//! <secs>.X<boot>P<pid>Q<delivery>R<random>M<usec>.D<machine>   (system ids)
//! <secs>.P<pid>Q<delivery>R<random>M<usec>.<hostname>          (fallback)
//! ```
//!
//! `secs` and `usec` come from one clock reading, `delivery` is a per-process
//! counter and `random` is 10 bytes from the operating system RNG, hex encoded.
//! Every field uses decimal, hex or hyphenated-UUID encoding, so none of them
//! can contain the `X`/`P`/`Q`/`R`/`M`/`D` markers' delimiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

use super::host::HostIdentity;

/// First value handed out by a fresh [`DeliveryCounter`].
///
/// Starting well above zero keeps real names visually distinct from the small
/// numbers that show up in tests and hand-written fixtures.
pub const COUNTER_START: u64 = 10_001;

/// Number of random bytes in every token.
const RANDOM_BYTES: usize = 10;

/// Errors that can occur while generating a unique name.
#[derive(Debug, Error)]
pub enum UniqueNameError {
    /// The operating system random source is unavailable.
    #[error("system random source unavailable: {0}")]
    Entropy(#[from] rand::Error),
}

/// Monotonic per-process delivery counter.
#[derive(Debug)]
pub struct DeliveryCounter {
    next: AtomicU64,
}

impl DeliveryCounter {
    pub fn new() -> Self {
        Self::starting_at(COUNTER_START)
    }

    pub fn starting_at(first: u64) -> Self {
        DeliveryCounter {
            next: AtomicU64::new(first),
        }
    }

    /// Returns the next value. Safe to call from several threads.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for DeliveryCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces unique delivery tokens.
#[derive(Debug)]
pub struct UniqueNameGenerator {
    host: Box<dyn HostIdentity>,
    pid: u32,
    counter: DeliveryCounter,
}

impl UniqueNameGenerator {
    /// Creates a generator for the current process.
    pub fn new(host: Box<dyn HostIdentity>) -> Self {
        Self::with_counter(host, DeliveryCounter::new())
    }

    /// Creates a generator with an explicitly owned counter.
    pub fn with_counter(host: Box<dyn HostIdentity>, counter: DeliveryCounter) -> Self {
        UniqueNameGenerator {
            host,
            pid: std::process::id(),
            counter,
        }
    }

    /// Generates a fresh token.
    ///
    /// # Errors
    ///
    /// Returns `UniqueNameError::Entropy` if the OS random source fails. This
    /// is not retried.
    pub fn next(&self) -> Result<String, UniqueNameError> {
        let mut random = [0u8; RANDOM_BYTES];
        OsRng.try_fill_bytes(&mut random)?;

        // A clock before 1970 is treated as the epoch; uniqueness does not
        // depend on the timestamp.
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let session = match self.host.session_tag() {
            Some(session) => format!("X{session}"),
            None => String::new(),
        };

        Ok(format!(
            "{}.{}P{}Q{}R{}M{}.{}",
            now.as_secs(),
            session,
            self.pid,
            self.counter.next(),
            hex::encode(random),
            now.subsec_micros(),
            self.host.host_tag(),
        ))
    }
}
