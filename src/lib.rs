//! Shellhooks: resilient notification registry for desktop-shell panels.
//!
//! A shell panel (say, the WiFi menu) has one upstream state object and many
//! small widgets that redraw from it. Upstream changes arrive in bursts, and
//! widgets can be destroyed or silently released by the display layer at any
//! time. This crate provides the plumbing between the two:
//!
//! Upstream source → debounce → dispatch sweep → subscriber callbacks
//!
//! # Architecture
//!
//! - **Source**: [`source::StateSource`] exposes a snapshot and a change signal
//! - **Timers**: [`timer::TimerHost`] arms one-shot and repeating timers on tokio
//! - **Subscribers**: [`subscriber::Subscriber`] plus the [`subscriber::is_live`] predicate
//! - **Registry**: [`registry::NotificationRegistry`] with stable slot indices,
//!   tombstones and periodic compaction
//! - **Network**: [`network::NetworkSnapshot`], the WiFi panel's upstream state

pub mod config;
pub mod error;
pub mod network;
pub mod registry;
pub mod source;
pub mod subscriber;
pub mod timer;
pub mod widget;

pub use config::{HooksConfig, RegistryConfig};
pub use error::{HooksError, Result};
pub use network::NetworkSnapshot;
pub use registry::{CompactionReport, NotificationRegistry, RegistryStats, SlotIndex};
pub use source::{SignalSource, StateSource, WatchSource};
pub use subscriber::{Subscriber, is_live};
pub use timer::{TimerHost, TokioTimers};
pub use widget::WidgetHandle;
