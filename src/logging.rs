//! Tracing setup.
//!
//! Two layers share one filter:
//! - stderr, compact, for the operator watching the loop,
//! - the run log, plain text, attached once the run log exists.
//!
//! The run log is only created after the project lock is held, so the file
//! layer starts detached and writes nothing until [`RunLogSlot::attach`].

use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// A run-log file that can be attached after the subscriber is installed.
#[derive(Debug, Clone, Default)]
pub struct RunLogSlot(Arc<OnceLock<Arc<File>>>);

impl RunLogSlot {
    /// Starts mirroring log events into `file`. Later calls are ignored.
    pub fn attach(&self, file: Arc<File>) {
        let _ = self.0.set(file);
    }
}

/// Writer handed out per event; discards output while detached.
pub struct SlotWriter(Option<Arc<File>>);

impl Write for SlotWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.0 {
            Some(file) => (&**file).write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.0 {
            Some(file) => (&**file).flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RunLogSlot {
    type Writer = SlotWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SlotWriter(self.0.get().cloned())
    }
}

/// Default filter directive when `RUST_LOG` is unset.
#[must_use]
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "ralph=debug,info" } else { "info" }
}

/// Installs the global subscriber and returns the run-log slot.
///
/// `RUST_LOG` takes precedence over `verbose`.
pub fn init(verbose: bool) -> RunLogSlot {
    let slot = RunLogSlot::default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(
            fmt::layer()
                .with_writer(slot.clone())
                .with_ansi(false)
                .with_target(false),
        )
        .try_init();

    slot
}
