//! Server-sent-event transport for hub subscriptions.
//!
//! Every hub frame becomes one SSE event: `connected` first, then one event
//! per broadcast (event name = push event name, data = JSON payload), with
//! keepalive frames sent as SSE comments.

use axum::response::sse::Event;
use futures::StreamExt;
use futures::stream::BoxStream;
use lab_core::{EventHub, HubFrame};
use serde_json::json;
use std::convert::Infallible;

/// Event name of the greeting frame.
pub const CONNECTED_EVENT: &str = "connected";

pub fn to_sse_event(frame: HubFrame) -> Event {
    match frame {
        HubFrame::Connected { client_id } => Event::default()
            .event(CONNECTED_EVENT)
            .data(json!({ "clientId": client_id }).to_string()),
        HubFrame::Event(event) => Event::default().event(event.name).data(event.data.to_string()),
        HubFrame::KeepAlive => Event::default().comment("keepalive"),
    }
}

/// Subscribes to `hub` and yields its frames as SSE events. Dropping the
/// stream unregisters the subscriber.
pub fn event_stream(hub: &EventHub) -> BoxStream<'static, Result<Event, Infallible>> {
    hub.serve().map(|frame| Ok(to_sse_event(frame))).boxed()
}
