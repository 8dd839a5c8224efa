//! Marshaling discipline for calls and signals.
//!
//! Outgoing calls are built from argument tuples whose field order and
//! types match the remote signature exactly. Incoming replies and signal
//! payloads are decoded into the expected tuple; a shape mismatch never
//! escapes as a panic. Calls report it as [`Error::Parse`], signals as an
//! error-log message.

use crate::dbus::BusConnection;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use zbus::message::{Flags, Message, Type as MessageType};
use zbus::zvariant::{DynamicType, Type};

/// Well-known bus name of the Avahi daemon.
pub const AVAHI_DBUS_NAME: &str = "org.freedesktop.Avahi";
pub const INTERFACE_SERVER: &str = "org.freedesktop.Avahi.Server";
pub const INTERFACE_SERVER2: &str = "org.freedesktop.Avahi.Server2";
pub const INTERFACE_ENTRY_GROUP: &str = "org.freedesktop.Avahi.EntryGroup";
pub const INTERFACE_RECORD_BROWSER: &str = "org.freedesktop.Avahi.RecordBrowser";
pub const INTERFACE_SERVICE_BROWSER: &str = "org.freedesktop.Avahi.ServiceBrowser";
pub const INTERFACE_SERVICE_RESOLVER: &str = "org.freedesktop.Avahi.ServiceResolver";

/// Object path of the server object.
pub const SERVER_PATH: &str = "/";

const GENERIC_ERROR: &str = "org.freedesktop.DBus.Error.Failed";

/// Build a method call to `destination`.
///
/// Auto-starting the daemon through bus activation is disabled: the client
/// only talks to a daemon it has seen appear on the bus.
pub(crate) fn method_call<B>(
    destination: &str,
    path: &str,
    interface: &str,
    method: &str,
    args: &B,
) -> Result<Message>
where
    B: Serialize + DynamicType,
{
    let message = Message::method_call(path, method)?
        .destination(destination)?
        .interface(interface)?
        .with_flags(Flags::NoAutoStart)?
        .build(args)?;
    Ok(message)
}

/// Dispatch a call and turn an error reply into [`Error::Daemon`].
pub(crate) async fn dispatch(bus: &dyn BusConnection, message: Message) -> Result<Message> {
    let reply = bus.call(message).await?;

    if reply.message_type() == MessageType::Error {
        return Err(daemon_error(&reply));
    }
    Ok(reply)
}

fn daemon_error(reply: &Message) -> Error {
    let header = reply.header();
    let name = header
        .error_name()
        .map(|name| name.to_string())
        .unwrap_or_else(|| GENERIC_ERROR.to_string());
    let message = reply.body().deserialize::<String>().unwrap_or_default();

    Error::Daemon { name, message }
}

/// Decode a message body into `T`.
pub(crate) fn decode<T>(message: &Message) -> zbus::Result<T>
where
    T: DeserializeOwned + Type,
{
    message.body().deserialize::<T>()
}

/// Decode a method reply, mapping a shape mismatch to [`Error::Parse`].
pub(crate) fn parse_reply<T>(owner: &str, method: &str, reply: &Message) -> Result<T>
where
    T: DeserializeOwned + Type,
{
    decode(reply).map_err(|e| {
        debug!("{} reply does not decode: {}", method, e);
        Error::Parse(format!("{}: Cannot parse response to \"{}\"", owner, method))
    })
}

/// Decode a signal payload. The error is the message for the error-log event.
pub(crate) fn parse_signal<T>(owner: &str, signal: &str, message: &Message) -> Result<T, String>
where
    T: DeserializeOwned + Type,
{
    decode(message).map_err(|e| {
        debug!("{} signal does not decode: {}", signal, e);
        format!("{}: Cannot parse \"{}\" parameters", owner, signal)
    })
}

/// A call in flight: the handle it was issued on plus the completion.
///
/// The handle is owned by the task, so losing the daemon afterwards does not
/// invalidate the call; the completion still fires with whatever the bus
/// reports.
pub(crate) struct PendingCall {
    bus: Result<Arc<dyn BusConnection>>,
    message: Result<Message>,
}

impl PendingCall {
    pub(crate) fn new(bus: Result<Arc<dyn BusConnection>>, message: Result<Message>) -> Self {
        Self { bus, message }
    }

    /// Run the call in the background. `completion` runs on the client's
    /// current-thread runtime, so never before the caller yields.
    pub(crate) fn spawn<T, P, F>(self, parse: P, completion: F)
    where
        T: Send + 'static,
        P: FnOnce(&Message) -> Result<T> + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.finish(parse).await;
            completion(result);
        });
    }

    /// Run the call in the current task.
    pub(crate) async fn finish<T, P>(self, parse: P) -> Result<T>
    where
        P: FnOnce(&Message) -> Result<T>,
    {
        let bus = self.bus?;
        let message = self.message?;
        let reply = dispatch(bus.as_ref(), message).await?;
        parse(&reply)
    }
}

/// Reply parser for methods that return nothing.
pub(crate) fn no_reply(_reply: &Message) -> Result<()> {
    Ok(())
}
