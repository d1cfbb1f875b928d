use thiserror::Error;

use crate::config::OptionsError;
use crate::linux::proc_maps::MapsParseError;
use crate::producer::ProducerProtocolError;

/// Errors that can escape to the caller of [`crate::capture::Capture`].
///
/// Everything that can be represented as an event on the capture stream is;
/// only capture-setup failures and producer protocol violations end up here.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid capture options: {0}")]
    InvalidOptions(#[from] OptionsError),

    #[error("could not parse /proc/{pid}/maps: {source}")]
    InvalidMaps {
        pid: i32,
        #[source]
        source: MapsParseError,
    },

    #[error("perf_event_open failed on all CPUs; last error: {0}")]
    PerfEventOpenFailedOnAllCpus(#[source] std::io::Error),

    #[error("producer protocol violation: {0}")]
    ProducerProtocol(#[from] ProducerProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
