//! The operator-facing log sink (§4.8, C8, ambient).
//!
//! Grounded on the teacher's `shipper::engine::Reporter` trait (a tiny
//! `info`/`warn`/`error` surface an engine reports progress through without
//! depending on any particular presentation). Here widened only by `&self`
//! instead of `&mut self`, since the daemon's reporting happens from several
//! concurrent tasks (the state machine and the authorization manager, §5)
//! rather than one single-threaded run.
//!
//! The default [`TracingSink`] is what production code uses; it exists
//! alongside direct `tracing::info!`/`warn!` call sites in this crate's other
//! modules because some call sites (the CLI's human-readable progress output)
//! want a presentation-layer seam independent of the `tracing` subscriber
//! configuration.

pub trait Sink: Send + Sync {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Routes every call straight into the `tracing` stream (§4.8).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl Sink for TracingSink {
    fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }
    fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
    }
    fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }
}

/// Install the process-wide `tracing` subscriber (env-filter, compact
/// formatter) used by the daemon and CLI binaries (§4.8).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).compact().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<String>>);

    impl Sink for RecordingSink {
        fn info(&self, msg: &str) {
            self.0.lock().unwrap().push(format!("INFO {msg}"));
        }
        fn warn(&self, msg: &str) {
            self.0.lock().unwrap().push(format!("WARN {msg}"));
        }
        fn error(&self, msg: &str) {
            self.0.lock().unwrap().push(format!("ERROR {msg}"));
        }
    }

    #[test]
    fn recording_sink_captures_level_and_message() {
        let sink = RecordingSink::default();
        sink.info("booted");
        sink.warn("retrying");
        assert_eq!(*sink.0.lock().unwrap(), vec!["INFO booted".to_string(), "WARN retrying".to_string()]);
    }
}
