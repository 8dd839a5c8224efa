//! Session with the Avahi daemon.
//!
//! A [`Client`] follows the daemon's presence on the bus. Every time the
//! daemon appears it subscribes to the server's `StateChanged` signal and
//! fires `connected`; when the daemon goes away it fires `disconnected` and
//! forgets the connection. Proxies created during one appearance are bound
//! to that appearance and are not carried over to the next one.
//!
//! All operations return immediately. Their completion runs later on the
//! tokio runtime, with either the decoded reply or an [`Error`]. The client
//! lives on a current-thread runtime, so a completion or event handler never
//! runs while the code that issued the call is still running.

use crate::codec::{
    self, PendingCall, AVAHI_DBUS_NAME, INTERFACE_SERVER, INTERFACE_SERVER2, SERVER_PATH,
};
use crate::config::BusConfig;
use crate::dbus::{self, BusConnection, Presence, SignalHandler, SignalMatch, Subscription};
use crate::entry_group::EntryGroup;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::proxy::{self, ProxyObject, Token};
use crate::record_browser::RecordBrowser;
use crate::service_browser::ServiceBrowser;
use crate::service_resolver::ServiceResolver;
use crate::types::{Interface, LookupFlags, Protocol, RecordClass, RecordType, ServerState};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::message::Message;
use zbus::zvariant::{DynamicType, OwnedObjectPath};

const OWNER: &str = "Client";

/// The daemon connection of one appearance.
struct Link {
    bus: Arc<dyn BusConnection>,
    state_changed: Option<Subscription>,
}

/// State shared between the client, its watch task and every proxy.
pub(crate) struct Session {
    daemon_name: String,
    link: Mutex<Option<Link>>,
    online: watch::Sender<bool>,
    connected: Event<()>,
    disconnected: Event<()>,
    server_state_changed: Event<(ServerState, String)>,
}

impl Session {
    fn new(daemon_name: String) -> Self {
        let (online, _) = watch::channel(false);
        Self {
            daemon_name,
            link: Mutex::new(None),
            online,
            connected: Event::new(),
            disconnected: Event::new(),
            server_state_changed: Event::new(),
        }
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn daemon_name(&self) -> &str {
        &self.daemon_name
    }

    /// Handle of the current appearance, if the daemon is present.
    pub(crate) fn current_bus(&self) -> Option<Arc<dyn BusConnection>> {
        self.link().as_ref().map(|link| link.bus.clone())
    }

    async fn appeared(self: &Arc<Self>, bus: Arc<dyn BusConnection>) {
        if self.current_bus().is_some() {
            warn!("{} appeared twice without vanishing", self.daemon_name);
            self.vanished();
        }

        let filter = SignalMatch::new(
            self.daemon_name.as_str(),
            INTERFACE_SERVER,
            "StateChanged",
            SERVER_PATH,
        );
        let state_changed = match Subscription::register(&bus, filter, self.state_handler()).await
        {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("Cannot subscribe to server StateChanged: {}", e);
                None
            }
        };

        *self.link() = Some(Link { bus, state_changed });

        info!("Connected to {}", self.daemon_name);
        self.connected.emit(&());
        self.online.send_replace(true);
    }

    fn vanished(&self) {
        if self.current_bus().is_none() {
            debug!("{} vanished while not connected", self.daemon_name);
            return;
        }

        info!("Disconnected from {}", self.daemon_name);
        self.online.send_replace(false);
        self.disconnected.emit(&());

        let link = self.link().take();
        if let Some(link) = link {
            if let Some(subscription) = link.state_changed {
                subscription.cancel();
            }
        }
    }

    fn state_handler(self: &Arc<Self>) -> SignalHandler {
        let session: Weak<Session> = Arc::downgrade(self);
        Box::new(move |message| {
            if let Some(session) = session.upgrade() {
                session.on_state_changed(&message);
            }
        })
    }

    fn on_state_changed(&self, message: &Message) {
        let change = codec::parse_signal::<(i32, String)>(OWNER, "StateChanged", message)
            .ok()
            .and_then(|(raw, error)| ServerState::from_raw(raw).map(|state| (state, error)));

        match change {
            Some(change) => {
                debug!("Server state changed to {}", change.0);
                self.server_state_changed.emit(&change);
            }
            None => {
                let failure = (
                    ServerState::Failure,
                    "Cannot parse \"StateChanged\" parameters".to_string(),
                );
                self.server_state_changed.emit(&failure);
            }
        }
    }

    /// Cancel the state subscription but keep the handle, so proxies that
    /// outlive the client can still free their objects.
    fn detach(&self) {
        let subscription = self
            .link()
            .as_mut()
            .and_then(|link| link.state_changed.take());
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }
}

/// Async client for the Avahi daemon.
///
/// Must be created inside a current-thread tokio runtime, e.g.
/// `#[tokio::main(flavor = "current_thread")]` or a `#[tokio::test]`.
pub struct Client {
    session: Arc<Session>,
    watch: JoinHandle<()>,
}

impl Client {
    /// Follow the daemon through `presence`, under the default well-known name.
    pub fn new(presence: mpsc::Receiver<Presence>) -> Self {
        Self::with_daemon_name(presence, AVAHI_DBUS_NAME)
    }

    /// Follow a daemon registered under `daemon_name`.
    ///
    /// # Panics
    ///
    /// Panics outside a current-thread tokio runtime.
    pub fn with_daemon_name(
        mut presence: mpsc::Receiver<Presence>,
        daemon_name: impl Into<String>,
    ) -> Self {
        assert!(on_current_thread(), "{}", Error::UnsupportedRuntime);

        let session = Arc::new(Session::new(daemon_name.into()));

        let driver = session.clone();
        let watch = tokio::spawn(async move {
            while let Some(change) = presence.recv().await {
                debug!("Daemon presence: {:?}", change);
                match change {
                    Presence::Appeared(bus) => driver.appeared(bus).await,
                    Presence::Vanished => driver.vanished(),
                }
            }
            debug!("Presence stream for {} closed", driver.daemon_name);
        });

        Self { session, watch }
    }

    /// Connect to the configured bus and watch the configured daemon name.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        if !on_current_thread() {
            return Err(Error::UnsupportedRuntime);
        }

        let connection = dbus::connect(config.kind, config.signal_queue_depth).await?;
        let presence = dbus::watch_name(connection, &config.daemon_name).await?;
        Ok(Self::with_daemon_name(presence, config.daemon_name.clone()))
    }

    /// Fired each time the daemon appears on the bus.
    pub fn connected(&self) -> &Event<()> {
        &self.session.connected
    }

    /// Fired each time the daemon leaves the bus.
    pub fn disconnected(&self) -> &Event<()> {
        &self.session.disconnected
    }

    /// Fired with the new server state and an error description.
    pub fn server_state_changed(&self) -> &Event<(ServerState, String)> {
        &self.session.server_state_changed
    }

    pub fn is_connected(&self) -> bool {
        self.session.current_bus().is_some()
    }

    /// Resolves once the daemon is present.
    pub async fn wait_connected(&self) {
        let mut online = self.session.online.subscribe();
        // The sender lives as long as the session we hold, so this never errs.
        let _ = online.wait_for(|online| *online).await;
    }

    fn server_call<B>(&self, interface: &str, method: &str, args: &B) -> PendingCall
    where
        B: Serialize + DynamicType,
    {
        PendingCall::new(
            self.session.current_bus().ok_or(Error::NotConnected),
            codec::method_call(&self.session.daemon_name, SERVER_PATH, interface, method, args),
        )
    }

    pub fn get_server_state<F>(&self, completion: F)
    where
        F: FnOnce(Result<ServerState>) + Send + 'static,
    {
        self.server_call(INTERFACE_SERVER, "GetState", &()).spawn(
            |reply| {
                let raw: i32 = codec::parse_reply(OWNER, "GetState", reply)?;
                ServerState::from_raw(raw).ok_or_else(|| {
                    Error::Parse(format!("{}: Cannot parse response to \"GetState\"", OWNER))
                })
            },
            completion,
        );
    }

    pub fn get_host_name<F>(&self, completion: F)
    where
        F: FnOnce(Result<String>) + Send + 'static,
    {
        self.server_call(INTERFACE_SERVER, "GetHostName", &())
            .spawn(|reply| codec::parse_reply(OWNER, "GetHostName", reply), completion);
    }

    pub fn set_host_name<F>(&self, name: &str, completion: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.server_call(INTERFACE_SERVER, "SetHostName", &name)
            .spawn(codec::no_reply, completion);
    }

    /// Ask the daemon to re-check a cached record.
    #[allow(clippy::too_many_arguments)]
    pub fn reconfirm_record<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        name: &str,
        class: RecordClass,
        record_type: RecordType,
        data: &[u8],
        completion: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let args = (interface, protocol, name, class, record_type, 0u32, data);
        self.server_call(INTERFACE_SERVER, "ReconfirmRecord", &args)
            .spawn(codec::no_reply, completion);
    }

    pub fn create_entry_group<F>(&self, completion: F)
    where
        F: FnOnce(Result<Arc<EntryGroup>>) + Send + 'static,
    {
        self.create(INTERFACE_SERVER, "EntryGroupNew", &(), EntryGroup::new, completion);
    }

    /// Browse raw records of `class`/`record_type` under `name`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_record_browser<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        name: &str,
        class: RecordClass,
        record_type: RecordType,
        flags: LookupFlags,
        completion: F,
    ) where
        F: FnOnce(Result<Arc<RecordBrowser>>) + Send + 'static,
    {
        let args = (interface, protocol, name, class, record_type, flags.bits());
        self.create(
            INTERFACE_SERVER2,
            "RecordBrowserPrepare",
            &args,
            RecordBrowser::new,
            completion,
        );
    }

    /// Browse services of `service_type`. An empty `domain` means the default.
    pub fn create_service_browser<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        service_type: &str,
        domain: &str,
        flags: LookupFlags,
        completion: F,
    ) where
        F: FnOnce(Result<Arc<ServiceBrowser>>) + Send + 'static,
    {
        let args = (interface, protocol, service_type, domain, flags.bits());
        self.create(
            INTERFACE_SERVER2,
            "ServiceBrowserPrepare",
            &args,
            ServiceBrowser::new,
            completion,
        );
    }

    /// Resolve one service instance to host, address, port and TXT data.
    #[allow(clippy::too_many_arguments)]
    pub fn create_service_resolver<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        name: &str,
        service_type: &str,
        domain: &str,
        address_protocol: Protocol,
        flags: LookupFlags,
        completion: F,
    ) where
        F: FnOnce(Result<Arc<ServiceResolver>>) + Send + 'static,
    {
        let args = (
            interface,
            protocol,
            name,
            service_type,
            domain,
            address_protocol,
            flags.bits(),
        );
        self.create(
            INTERFACE_SERVER2,
            "ServiceResolverPrepare",
            &args,
            ServiceResolver::new,
            completion,
        );
    }

    /// Issue a `*New`/`*Prepare` call, wrap the returned path in a proxy and
    /// hand it to `completion`.
    fn create<B, P, C, Fut, F>(
        &self,
        interface: &str,
        method: &'static str,
        args: &B,
        construct: C,
        completion: F,
    ) where
        B: Serialize + DynamicType,
        P: ProxyObject,
        C: FnOnce(Token, Arc<Session>, Arc<dyn BusConnection>, String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<P>>> + Send + 'static,
        F: FnOnce(Result<Arc<P>>) + Send + 'static,
    {
        let bus = self.session.current_bus();
        let message = codec::method_call(
            &self.session.daemon_name,
            SERVER_PATH,
            interface,
            method,
            args,
        );
        let session = self.session.clone();

        tokio::spawn(async move {
            let prepared = match prepare(bus, message, method).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    debug!("{} failed: {}", method, e);
                    completion(Err(e));
                    return;
                }
            };

            let (bus, object_path) = prepared;
            match construct(Token::new(), session, bus, object_path).await {
                Ok(proxy) => proxy::deliver(proxy, completion).await,
                Err(e) => {
                    warn!("Cannot set up proxy after {}: {}", method, e);
                    completion(Err(e));
                }
            }
        });
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.watch.abort();
        self.session.detach();
    }
}

/// Whether the caller runs on a current-thread tokio runtime.
fn on_current_thread() -> bool {
    matches!(
        Handle::try_current().map(|runtime| runtime.runtime_flavor()),
        Ok(RuntimeFlavor::CurrentThread)
    )
}

/// Run a `*New`/`*Prepare` call and return the handle it ran on plus the
/// object path from the reply.
async fn prepare(
    bus: Option<Arc<dyn BusConnection>>,
    message: Result<Message>,
    method: &str,
) -> Result<(Arc<dyn BusConnection>, String)> {
    let bus = bus.ok_or(Error::NotConnected)?;
    let reply = codec::dispatch(bus.as_ref(), message?).await?;
    let path: OwnedObjectPath = codec::parse_reply(OWNER, method, &reply)?;
    Ok((bus, path.as_str().to_string()))
}
