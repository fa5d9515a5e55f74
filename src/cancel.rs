//! operator interruption and critical sections
//!
//! SIGINT/SIGTERM only raise a flag; the runner and the pipeline poll it at
//! safe points. the publish swap blocks both signals so it cannot be split.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use crate::error::{Error, Result};

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: nix::libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// install SIGINT and SIGTERM handlers that request cancellation
pub fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // the handler only touches an atomic, which is async-signal-safe
        unsafe { sigaction(sig, &action) }.map_err(|e| Error::Io {
            path: "sigaction".into(),
            source: std::io::Error::from(e),
        })?;
    }
    Ok(())
}

/// shared cancellation flag
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    local: Arc<AtomicBool>,
    follow_signals: bool,
}

impl Cancellation {
    /// a flag that is only raised by [`Cancellation::cancel`]
    pub fn new() -> Self {
        Self::default()
    }

    /// a flag that is also raised by the process signal handlers
    pub fn from_signals() -> Self {
        Self {
            local: Arc::default(),
            follow_signals: true,
        }
    }

    pub fn cancel(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.local.load(Ordering::SeqCst)
            || (self.follow_signals && SIGNALLED.load(Ordering::SeqCst))
    }

    /// fail with [`Error::Cancelled`] if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// blocks SIGINT and SIGTERM on this thread until dropped
///
/// pending signals are delivered when the previous mask is restored
pub struct CriticalSection {
    previous: Option<SigSet>,
}

impl CriticalSection {
    pub fn enter() -> Self {
        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        set.add(Signal::SIGTERM);

        let previous = match set.thread_swap_mask(SigmaskHow::SIG_BLOCK) {
            Ok(old) => Some(old),
            Err(e) => {
                tracing::warn!(error = %e, "could not block signals for critical section");
                None
            }
        };
        Self { previous }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if let Some(old) = self.previous.take() {
            if let Err(e) = old.thread_set_mask() {
                tracing::warn!(error = %e, "could not restore signal mask");
            }
        }
    }
}
