//! Server-push change notifications.

mod channel;
mod event;
mod sse;

pub use channel::{ChannelState, EventSource, EventStream, HttpEventSource, RealtimeChannel};
pub use event::{decode_event, RealtimeEvent, RealtimeMessage};
pub use sse::{SseDecoder, SseFrame};
