//! Server-Sent Events (SSE) frame helpers
//!
//! Every push frame carries `event:`, `id:` and `data:` fields so browsers can
//! resume with `Last-Event-ID` after reconnecting.

use axum::response::sse::Event as SseEvent;
use serde_json::json;

use crate::events::Event;

/// SSE `event:` name of heartbeat frames
pub const HEARTBEAT_EVENT: &str = "heartbeat";
/// SSE `event:` name of the resynchronize signal
pub const RESYNC_EVENT: &str = "resync";
/// SSE `event:` name sent just before the server closes the stream
pub const CLOSE_EVENT: &str = "close";
/// SSE `event:` name of the first frame on a new stream
pub const CONNECTED_EVENT: &str = "connected";

/// Frame for one logged event
pub fn event_frame(event: &Event) -> SseEvent {
    SseEvent::default()
        .event(event.event_type.clone())
        .id(event.id.to_string())
        .data(event.payload.to_string())
}

/// Heartbeat frame; carries the cursor so clients can spot a stalled stream
pub fn heartbeat_frame(cursor: u64) -> SseEvent {
    SseEvent::default()
        .event(HEARTBEAT_EVENT)
        .data(json!({ "lastEventId": cursor, "at": crate::time::now() }).to_string())
}

/// The client's cursor fell out of the retention window; it must refetch state
pub fn resync_frame(oldest_available: u64, head: u64) -> SseEvent {
    SseEvent::default().event(RESYNC_EVENT).data(
        json!({
            "resync": true,
            "oldestAvailable": oldest_available,
            "lastEventId": head,
        })
        .to_string(),
    )
}

/// Server is ending the stream; the client should renegotiate
pub fn close_frame(reason: &str) -> SseEvent {
    SseEvent::default()
        .event(CLOSE_EVENT)
        .data(json!({ "reason": reason }).to_string())
}

/// First frame on a push stream
pub fn connected_frame(connection_id: &str, cursor: u64) -> SseEvent {
    SseEvent::default().event(CONNECTED_EVENT).data(
        json!({
            "connectionId": connection_id,
            "lastEventId": cursor,
        })
        .to_string(),
    )
}
