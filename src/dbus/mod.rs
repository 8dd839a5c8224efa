//! D-Bus transport used by the Avahi client.
//!
//! The client never talks to zbus directly. It goes through a
//! [`BusConnection`] handle, which is handed out by a presence watch each
//! time the daemon's well-known name gets an owner:
//!
//! ```text
//! ┌──────────────┐  Presence::Appeared(handle)  ┌──────────────┐
//! │  watch_name  │─────────────────────────────>│    Client    │
//! │ (NameOwner-  │  Presence::Vanished          │  (session)   │
//! │  Changed)    │─────────────────────────────>│              │
//! └──────────────┘                              └──────┬───────┘
//!                                                      │ call / subscribe
//!                                               ┌──────▼───────┐
//!                                               │ BusConnection│
//!                                               └──────────────┘
//! ```
//!
//! [`ZbusConnection`] and [`watch_name`] are the production implementation.
//! Tests substitute an in-memory daemon implementing [`BusConnection`].

mod connection;
mod watch;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use zbus::message::{Message, Type as MessageType};

pub use connection::ZbusConnection;
pub use watch::{connect, watch_name};

/// Token identifying one signal subscription on one [`BusConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receives every signal message matching a subscription.
pub type SignalHandler = Box<dyn Fn(Message) + Send + Sync>;

/// Match rule for a signal subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMatch {
    pub sender: String,
    pub interface: String,
    pub member: String,
    pub path: String,
}

impl SignalMatch {
    pub fn new(
        sender: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            interface: interface.into(),
            member: member.into(),
            path: path.into(),
        }
    }

    /// Whether `message` is a signal selected by this rule.
    ///
    /// The sender is not compared: signals carry the unique name of the
    /// emitter, not the well-known name the rule was built from.
    pub fn matches(&self, message: &Message) -> bool {
        if message.message_type() != MessageType::Signal {
            return false;
        }

        let header = message.header();
        header.interface().map(|i| i.as_str()) == Some(self.interface.as_str())
            && header.member().map(|m| m.as_str()) == Some(self.member.as_str())
            && header.path().map(|p| p.as_str()) == Some(self.path.as_str())
    }
}

/// An established bus connection through which the daemon is reachable.
#[async_trait]
pub trait BusConnection: Send + Sync + 'static {
    /// Send a method call and wait for its reply.
    ///
    /// The reply is returned as is, error replies included. Implementations
    /// must not apply a timeout.
    async fn call(&self, message: Message) -> zbus::Result<Message>;

    /// Register `handler` for signals matching `filter`.
    ///
    /// Once this returns, every matching signal is delivered to `handler`
    /// until [`BusConnection::unsubscribe`] is called with the returned id.
    async fn subscribe(
        &self,
        filter: SignalMatch,
        handler: SignalHandler,
    ) -> zbus::Result<SubscriptionId>;

    /// Drop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Presence of the daemon's well-known name on the bus.
pub enum Presence {
    /// The name got an owner; calls go through the given handle.
    Appeared(Arc<dyn BusConnection>),
    /// The name lost its owner.
    Vanished,
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Presence::Appeared(_) => f.write_str("Appeared"),
            Presence::Vanished => f.write_str("Vanished"),
        }
    }
}

/// One live signal registration: the token plus the handle that issued it.
///
/// A token is only ever cancelled against its own handle, never against a
/// connection that superseded it.
pub(crate) struct Subscription {
    bus: Arc<dyn BusConnection>,
    id: SubscriptionId,
}

impl Subscription {
    pub(crate) async fn register(
        bus: &Arc<dyn BusConnection>,
        filter: SignalMatch,
        handler: SignalHandler,
    ) -> zbus::Result<Self> {
        let id = bus.subscribe(filter, handler).await?;
        Ok(Self {
            bus: bus.clone(),
            id,
        })
    }

    pub(crate) fn cancel(self) {
        self.bus.unsubscribe(self.id);
    }
}

/// Whether two handles are the same connection instance.
pub(crate) fn same_connection(a: &Arc<dyn BusConnection>, b: &Arc<dyn BusConnection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
