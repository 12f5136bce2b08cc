use crate::ids::SessionId;
use crate::protocol::ClientLogRecord;

/// Destination for log records forwarded by connected clients.
///
/// Fire-and-forget: implementations report their own failures and never
/// block the caller on I/O errors.
pub trait LogSink: Send + Sync {
    fn append(&self, session_id: &SessionId, records: &[ClientLogRecord]);
}

/// Discards everything. Used when log persistence is turned off.
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn append(&self, _session_id: &SessionId, _records: &[ClientLogRecord]) {}
}
