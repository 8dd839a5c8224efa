//! Lifecycle shared by every proxy object.
//!
//! A proxy wraps one daemon-side object path. It subscribes to its signals
//! while being constructed, the creation completion runs next, and only then
//! is `Start` sent. On drop every subscription is cancelled against the
//! handle that produced it; `Free` follows only while the session still runs
//! on that same handle.

use crate::client::Session;
use crate::codec::{self, PendingCall};
use crate::dbus::{same_connection, BusConnection, SignalHandler, SignalMatch, Subscription};
use crate::error::{Error, Result};
use crate::event::Event;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, warn};
use zbus::message::Message;

/// Capability to construct proxies. Only the client can create one, so an
/// object path always comes from a successful `*New`/`*Prepare` call.
pub(crate) struct Token(());

impl Token {
    pub(crate) fn new() -> Self {
        Token(())
    }
}

/// Implemented by the four proxy types.
pub(crate) trait ProxyObject: Send + Sync + 'static {
    /// Whether the daemon object needs an explicit `Start`.
    const NEEDS_START: bool;

    fn core(&self) -> &ProxyCore;

    fn error_log(&self) -> &Event<String>;

    /// Log and forward a problem through the error-log event.
    fn report(&self, message: String) {
        warn!("{}", message);
        self.error_log().emit(&message);
    }

    /// Decode a signal payload, reporting a mismatch through the error log.
    fn decode<T>(&self, signal: &str, message: &Message) -> Option<T>
    where
        T: serde::de::DeserializeOwned + zbus::zvariant::Type,
    {
        match codec::parse_signal(self.core().owner(), signal, message) {
            Ok(payload) => Some(payload),
            Err(problem) => {
                self.report(problem);
                None
            }
        }
    }

    /// Report a payload that decoded but carries out-of-range values.
    fn malformed(&self, signal: &str) {
        self.report(format!(
            "{}: Cannot parse \"{}\" parameters",
            self.core().owner(),
            signal
        ));
    }
}

/// State common to all proxies.
pub(crate) struct ProxyCore {
    session: Arc<Session>,
    bus: Arc<dyn BusConnection>,
    object_path: String,
    interface: &'static str,
    owner: &'static str,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ProxyCore {
    pub(crate) fn new(
        _token: Token,
        session: Arc<Session>,
        bus: Arc<dyn BusConnection>,
        object_path: String,
        interface: &'static str,
        owner: &'static str,
    ) -> Self {
        debug!("{} created at {}", owner, object_path);
        Self {
            session,
            bus,
            object_path,
            interface,
            owner,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn object_path(&self) -> &str {
        &self.object_path
    }

    pub(crate) fn owner(&self) -> &'static str {
        self.owner
    }

    /// Subscribe to `signal` on this object's path.
    pub(crate) async fn subscribe(&self, signal: &str, handler: SignalHandler) -> Result<()> {
        let filter = SignalMatch::new(
            self.session.daemon_name(),
            self.interface,
            signal,
            self.object_path.as_str(),
        );
        let subscription = Subscription::register(&self.bus, filter, handler).await?;

        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);
        Ok(())
    }

    /// The handle this proxy was created on, if the session still uses it.
    fn live_bus(&self) -> Result<Arc<dyn BusConnection>> {
        match self.session.current_bus() {
            Some(current) if same_connection(&current, &self.bus) => Ok(current),
            _ => Err(Error::NotConnected),
        }
    }

    fn message<B>(&self, method: &str, args: &B) -> Result<Message>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        codec::method_call(
            self.session.daemon_name(),
            &self.object_path,
            self.interface,
            method,
            args,
        )
    }

    /// A call on this object, issued on the proxy's own handle.
    pub(crate) fn call<B>(&self, method: &str, args: &B) -> PendingCall
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        PendingCall::new(self.live_bus(), self.message(method, args))
    }
}

impl Drop for ProxyCore {
    fn drop(&mut self) {
        let subscriptions = std::mem::take(
            self.subscriptions
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for subscription in subscriptions {
            subscription.cancel();
        }

        let bus = match self.live_bus() {
            Ok(bus) => bus,
            Err(_) => {
                debug!(
                    "{} {} dropped without daemon connection, skipping Free",
                    self.owner, self.object_path
                );
                return;
            }
        };

        let message = match self.message("Free", &()) {
            Ok(message) => message,
            Err(e) => {
                warn!("Cannot build Free call for {}: {}", self.object_path, e);
                return;
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Freeing {} {}", self.owner, self.object_path);
                // Fire and forget: the reply is of no interest.
                runtime.spawn(async move {
                    let _ = bus.call(message).await;
                });
            }
            Err(_) => warn!(
                "{} {} dropped outside a tokio runtime, Free not sent",
                self.owner, self.object_path
            ),
        }
    }
}

/// Route a signal to `proxy` while it is alive.
pub(crate) fn route<P, H>(proxy: &Weak<P>, handler: H) -> SignalHandler
where
    P: Send + Sync + 'static,
    H: Fn(&P, &Message) + Send + Sync + 'static,
{
    let proxy = proxy.clone();
    Box::new(move |message| {
        if let Some(proxy) = proxy.upgrade() {
            handler(&proxy, &message);
        }
    })
}

/// Hand a freshly built proxy to its creation completion, then send `Start`
/// if the proxy type needs it.
///
/// The completion runs before `Start` so that handlers attached there see
/// the very first signals. Only a weak reference is held while `Start` is in
/// flight; a proxy the application did not keep is torn down right away.
pub(crate) async fn deliver<P, F>(proxy: Arc<P>, completion: F)
where
    P: ProxyObject,
    F: FnOnce(Result<Arc<P>>),
{
    completion(Ok(proxy.clone()));

    if !P::NEEDS_START {
        return;
    }

    let weak = Arc::downgrade(&proxy);
    drop(proxy);

    let start = match weak.upgrade() {
        Some(proxy) => proxy.core().call("Start", &()),
        None => return,
    };

    if let Err(e) = start.finish(codec::no_reply).await {
        if let Some(proxy) = weak.upgrade() {
            let owner = proxy.core().owner();
            proxy.report(format!("{}: D-Bus call \"Start\" failed: {}", owner, e));
        }
    }
}
