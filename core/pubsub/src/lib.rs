//! Topic-based publish/subscribe for fleetd.
//!
//! Producers depend on the [`Publisher`] trait only; the in-process
//! [`EventBus`] is the implementation wired up by the server and used in
//! tests. Every live subscriber receives every message published after it
//! subscribed, in publish order per topic; a subscriber that falls behind
//! slows publishers down instead of losing messages.

pub mod bus;

pub use bus::{Event, EventBus, Publisher, Subscription};
