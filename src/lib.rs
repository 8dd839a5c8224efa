//! Async client for the Avahi mDNS/DNS-SD daemon over D-Bus.
//!
//! The [`Client`] tracks whether the daemon is present on the bus and hands
//! out proxies for daemon-side objects: [`EntryGroup`] for publishing,
//! [`RecordBrowser`] and [`ServiceBrowser`] for browsing and
//! [`ServiceResolver`] for resolving. Every operation takes a completion
//! that runs later on the tokio runtime; daemon signals are delivered
//! through [`Event`] observer lists, each object's in the order the daemon
//! sent them. The client runs on a current-thread tokio runtime.
//!
//! ```no_run
//! # async fn run() -> avahi_async::Result<()> {
//! use avahi_async::{Client, Config, LookupFlags, IF_UNSPEC, PROTO_UNSPEC};
//!
//! let client = Client::connect(&Config::default().bus).await?;
//! client.wait_connected().await;
//!
//! client.create_service_browser(
//!     IF_UNSPEC,
//!     PROTO_UNSPEC,
//!     "_http._tcp",
//!     "",
//!     LookupFlags::empty(),
//!     |browser| {
//!         if let Ok(browser) = browser {
//!             browser.item_new().connect(|item| println!("{}", item.name));
//!         }
//!     },
//! );
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod dbus;
pub mod entry_group;
pub mod error;
pub mod event;
mod proxy;
pub mod record_browser;
pub mod service_browser;
pub mod service_resolver;
pub mod types;

// Re-export commonly used types for convenience
pub use client::Client;
pub use config::Config;
pub use entry_group::EntryGroup;
pub use error::{Error, Result};
pub use event::{Event, HandlerId};
pub use record_browser::RecordBrowser;
pub use service_browser::ServiceBrowser;
pub use service_resolver::ServiceResolver;
pub use types::*;
