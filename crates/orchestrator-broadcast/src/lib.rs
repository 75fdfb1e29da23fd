//! Pub/sub fan-out bridging store-observed events to external
//! consumers (the HTTP/SSE surface, in particular).

pub mod broadcaster;
pub mod event;

pub use broadcaster::{Broadcaster, Subscription};
pub use event::BroadcastEvent;
