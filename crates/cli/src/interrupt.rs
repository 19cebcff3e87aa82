use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use derive_more::{Display, Error};

/// Exit code used when the user interrupts the process.
pub(crate) const CANCELLED_EXIT_CODE: u8 = 130;

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// User-initiated cancellation.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
#[display(fmt = "Cancelled.")]
pub(crate) struct Cancelled;

/// Error returned by [`Interrupt::sleep_until`].
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub(crate) enum SleepError {
    /// Interrupt was raised while sleeping.
    Cancelled(Cancelled),

    /// Deadline passed before the full duration elapsed.
    #[display(fmt = "deadline exceeded")]
    DeadlineExceeded,
}

/// Shared Ctrl-C flag.
///
/// The process installs a single handler that raises the flag; blocking loops poll it
/// between reads and while sleeping.
#[derive(Clone, Default)]
pub(crate) struct Interrupt {
    raised: Arc<AtomicBool>,
}

impl Interrupt {
    /// Create a flag that is only raised manually.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create a flag raised by Ctrl-C.
    ///
    /// A second Ctrl-C terminates the process right away.
    pub(crate) fn install() -> Result<Self, ctrlc::Error> {
        let interrupt = Self::new();
        let raised = interrupt.raised.clone();

        ctrlc::set_handler(move || {
            if raised.swap(true, Ordering::SeqCst) {
                std::process::exit(CANCELLED_EXIT_CODE.into());
            }
        })?;

        Ok(interrupt)
    }

    pub(crate) fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Return [`Cancelled`] if the flag was raised.
    pub(crate) fn check(&self) -> Result<(), Cancelled> {
        if self.is_raised() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early on interrupt.
    pub(crate) fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        match self.sleep_until(duration, None) {
            Err(SleepError::Cancelled(cancelled)) => Err(cancelled),
            // Unreachable without a deadline.
            Ok(()) | Err(SleepError::DeadlineExceeded) => Ok(()),
        }
    }

    /// Sleep for `duration`, giving up once `deadline` passes.
    pub(crate) fn sleep_until(
        &self,
        duration: Duration,
        deadline: Option<Instant>,
    ) -> Result<(), SleepError> {
        let wake_at = Instant::now() + duration;

        loop {
            self.check().map_err(SleepError::Cancelled)?;

            let now = Instant::now();

            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(SleepError::DeadlineExceeded);
            }

            if now >= wake_at {
                return Ok(());
            }

            let mut slice = (wake_at - now).min(SLEEP_SLICE);

            if let Some(deadline) = deadline {
                slice = slice.min(deadline - now);
            }

            thread::sleep(slice);
        }
    }
}
