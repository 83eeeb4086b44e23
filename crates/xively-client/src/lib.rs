//! xively-client - event-driven MQTT client engine for Xively devices.
//!
//! One [`Xively`] instance drives any number of MQTT contexts from a single
//! thread. Every connection is a chain of layers (socket, optional TLS,
//! MQTT codec, MQTT logic) whose steps are scheduled on a cooperative
//! event dispatcher; the application runs the loop with
//! [`Xively::events_process_blocking`] or [`Xively::events_process_tick`].
//!
//! # Example
//!
//! ```ignore
//! use xively_client::{QoS, State, Xively};
//!
//! let mut xi = Xively::initialize("account-id", "device-id")?.with_password("secret");
//! let ctx = xi.create_context()?;
//! xi.connect(ctx, Box::new(|xi, ctx, _data, state| {
//!     if state == State::Ok {
//!         let topic = xi.telemetry_topic("temperature").unwrap_or_default();
//!         let _ = xi.publish(ctx, &topic, "21.5", QoS::AtLeastOnce, false, None);
//!     }
//! }))?;
//! xi.events_process_blocking();
//! ```

pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod context;
pub mod control_topic;
pub mod dispatcher;
pub mod events;
pub mod fs;
pub mod layer;
mod packet_id;
mod registry;
pub mod resource_manager;
pub mod session;
pub mod sft;
pub mod state;
pub mod timed_task;
pub mod topic;

pub use backoff::{BackoffClass, BackoffStatus};
pub use client::{format_timeseries_record, ResourceStats, Xively};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionData, ConnectionState, LastWill, SessionType};
pub use context::{Context, ContextHandle};
pub use events::{ConnectionCallback, PublishCallback, SubscriptionCallback, SubscriptionData};
pub use fs::{Filesystem, FsHandle, FsStat, MemoryFs, OpenFlags, PosixFs};
pub use layer::{Layer, LayerCx, LayerData, LayerOp, TransportFactory};
pub use registry::HandleRegistry;
pub use sft::{FirmwareHooks, SftContext, UrlHandler};
pub use state::{Result, State};
pub use timed_task::{Repeat, TaskCallback, TimedTaskHandle};

// Re-export the wire types applications deal with
pub use xively_core::{Packet, QoS, SubackStatus};
