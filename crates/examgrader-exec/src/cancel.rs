//! Run-wide cancellation.
//!
//! A [`CancelToken`] is cloned into every worker. The runner polls it while waiting on a
//! child and kills the child's process group as soon as it trips, using the same path as a
//! timeout.

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

static SIGNALLED: AtomicBool = AtomicBool::new(false);
static INSTALL: Once = Once::new();

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    follow_signals: bool,
}

impl CancelToken {
    /// A token that only trips when [`CancelToken::cancel`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips when this process receives SIGINT or SIGTERM.
    ///
    /// Children run in their own process groups, so a terminal interrupt reaches only the
    /// harness; the runner then kills every in-flight group before returning.
    pub fn with_signal_handlers() -> std::io::Result<Self> {
        install_signal_handlers()?;
        Ok(Self {
            flag: Arc::default(),
            follow_signals: true,
        })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.follow_signals && SIGNALLED.load(Ordering::SeqCst))
    }
}

extern "C" fn on_terminate(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> std::io::Result<()> {
    let mut result = Ok(());
    INSTALL.call_once(|| {
        let handler: extern "C" fn(libc::c_int) = on_terminate;
        for signal in [libc::SIGINT, libc::SIGTERM] {
            // SAFETY: the handler performs a single atomic store, which is
            // async-signal-safe, and never returns control anywhere unusual.
            let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
            if previous == libc::SIG_ERR {
                result = Err(std::io::Error::last_os_error());
                return;
            }
        }
    });
    result
}
