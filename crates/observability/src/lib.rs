//! Process-wide tracing setup shared by outboxd binaries.

/// Install the JSON subscriber. Later calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::Json);
}

/// Subscriber configuration (filters, formats).
pub mod tracing;

pub use self::tracing::LogFormat;
