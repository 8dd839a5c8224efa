//! Service resolver proxy.
//!
//! Resolves one service instance, found by a [`ServiceBrowser`], into the
//! host name, address, port and TXT data needed to contact it. The resolver
//! keeps running and fires [`ServiceResolver::found`] again whenever the
//! published data changes.
//!
//! [`ServiceBrowser`]: crate::service_browser::ServiceBrowser

use crate::client::Session;
use crate::codec::INTERFACE_SERVICE_RESOLVER;
use crate::dbus::BusConnection;
use crate::error::Result;
use crate::event::Event;
use crate::proxy::{self, ProxyCore, ProxyObject, Token};
use crate::types::{LookupResultFlags, ResolvedService};
use std::sync::Arc;
use tracing::debug;
use zbus::message::Message;

const OWNER: &str = "ServiceResolver";

type FoundPayload = (
    i32,
    i32,
    String,
    String,
    String,
    String,
    i32,
    String,
    u16,
    Vec<Vec<u8>>,
    u32,
);

pub struct ServiceResolver {
    core: ProxyCore,
    found: Event<ResolvedService>,
    failure: Event<String>,
    error_log: Event<String>,
}

impl ServiceResolver {
    pub(crate) async fn new(
        token: Token,
        session: Arc<Session>,
        bus: Arc<dyn BusConnection>,
        object_path: String,
    ) -> Result<Arc<Self>> {
        let resolver = Arc::new(Self {
            core: ProxyCore::new(
                token,
                session,
                bus,
                object_path,
                INTERFACE_SERVICE_RESOLVER,
                OWNER,
            ),
            found: Event::new(),
            failure: Event::new(),
            error_log: Event::new(),
        });

        let weak = Arc::downgrade(&resolver);
        resolver
            .core
            .subscribe("Found", proxy::route(&weak, Self::on_found))
            .await?;
        resolver
            .core
            .subscribe("Failure", proxy::route(&weak, Self::on_failure))
            .await?;

        Ok(resolver)
    }

    pub fn object_path(&self) -> &str {
        self.core.object_path()
    }

    pub fn found(&self) -> &Event<ResolvedService> {
        &self.found
    }

    /// Fired with the daemon's error message, e.g. on a resolve timeout.
    pub fn failure(&self) -> &Event<String> {
        &self.failure
    }

    pub fn error_log(&self) -> &Event<String> {
        &self.error_log
    }

    fn on_found(&self, message: &Message) {
        let Some(payload) = self.decode::<FoundPayload>("Found", message) else {
            return;
        };
        let (
            interface,
            protocol,
            name,
            service_type,
            domain,
            host,
            address_protocol,
            address,
            port,
            txt,
            flags,
        ) = payload;

        debug!("Resolved {} to {}:{}", name, address, port);
        self.found.emit(&ResolvedService {
            interface,
            protocol,
            name,
            service_type,
            domain,
            host,
            address_protocol,
            address,
            port,
            txt,
            flags: LookupResultFlags::from_bits_retain(flags),
        });
    }

    fn on_failure(&self, message: &Message) {
        if let Some(error) = self.decode::<String>("Failure", message) {
            self.failure.emit(&error);
        }
    }
}

impl ProxyObject for ServiceResolver {
    const NEEDS_START: bool = true;

    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn error_log(&self) -> &Event<String> {
        &self.error_log
    }
}
