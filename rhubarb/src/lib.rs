//! An actor based client for NATS-protocol publish/subscribe servers
//!
//! A [`Client`] owns one long-lived connection driven by a background
//! task. Publishes, subscriptions and requests are issued through
//! cheaply `Clone`able handles; when the connection drops, the driver
//! walks the configured server pool, re-establishes the session,
//! re-issues every open subscription and replays publishes buffered in
//! the meantime.
//!
//! ```no_run
//! use rhubarb::{proto::Subject, Client};
//!
//! # async fn example() -> Result<(), rhubarb::Error> {
//! let client = Client::connect("nats://127.0.0.1:4222").await?;
//!
//! let mut subscription = client
//!     .subscribe(Subject::from_static("greet.>"), None)
//!     .await?;
//! client
//!     .publish(Subject::from_static("greet.joe"), "hello".into())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub use rhubarb_proto as proto;

pub use self::client::{Auth, Client, ClientBuilder, ClientStatistics, ConnectionStatus};
pub use self::error::{Error, ErrorKind};
pub use self::subscription::{Subscription, SubscriptionStats};

mod atomic;
mod client;
mod error;
mod events;
mod handler;
mod pool;
mod response;
mod subscription;
