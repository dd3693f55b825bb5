//! Request path: bytes in → decode → publish to the scheduler.
//!
//! Extracted so integration tests and benchmarks can drive the flow without io_uring.

use crate::metrics;
use crate::protocol::{self, ParseError, ParseResult};
use crate::ring_types::Measurement;
use crate::scheduler::{MeasurementPublisher, PublishOutcome};

/// Why `publish_measurements_from_buffer` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStop {
    /// Only a partial line (or nothing) is left.
    Drained,
    /// The scheduler refused a measurement; it is parked in `pending`.
    Full,
    /// The scheduler is closed.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowProgress {
    pub consumed: usize,
    pub published: usize,
    pub stop: FlowStop,
}

/// Publish `pending` (a measurement refused earlier), then every complete line in `buf`.
/// Returns the bytes consumed and why processing stopped.
///
/// A refused measurement's bytes count as consumed: it lives in `pending` until accepted, so a
/// retry neither loses nor duplicates it. On a parse error the caller must drop the connection.
pub fn publish_measurements_from_buffer(
    buf: &[u8],
    publisher: &mut MeasurementPublisher,
    pending: &mut Option<Measurement>,
    connection_id: u64,
) -> Result<FlowProgress, ParseError> {
    let mut progress = FlowProgress {
        consumed: 0,
        published: 0,
        stop: FlowStop::Drained,
    };

    if pending.is_some() {
        match publisher.try_publish(connection_id, pending) {
            PublishOutcome::Accepted => progress.published += 1,
            PublishOutcome::Full => {
                progress.stop = FlowStop::Full;
                return Ok(progress);
            }
            PublishOutcome::Closed => {
                progress.stop = FlowStop::Closed;
                return Ok(progress);
            }
        }
    }

    while progress.consumed < buf.len() {
        match protocol::try_parse_line(&buf[progress.consumed..]) {
            ParseResult::Complete {
                measurement,
                bytes_consumed,
            } => {
                progress.consumed += bytes_consumed;
                *pending = Some(measurement);
                match publisher.try_publish(connection_id, pending) {
                    PublishOutcome::Accepted => progress.published += 1,
                    PublishOutcome::Full => {
                        progress.stop = FlowStop::Full;
                        break;
                    }
                    PublishOutcome::Closed => {
                        progress.stop = FlowStop::Closed;
                        break;
                    }
                }
            }
            ParseResult::Skip(bytes_consumed) => progress.consumed += bytes_consumed,
            ParseResult::Incomplete => break,
            ParseResult::Error(e) => {
                metrics::inc_parse_errors();
                return Err(e);
            }
        }
    }
    Ok(progress)
}
