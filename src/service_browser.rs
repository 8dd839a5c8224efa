//! Service browser proxy: service instances of one type in one domain.

use crate::client::Session;
use crate::codec::INTERFACE_SERVICE_BROWSER;
use crate::dbus::BusConnection;
use crate::error::Result;
use crate::event::Event;
use crate::proxy::{self, ProxyCore, ProxyObject, Token};
use crate::types::{LookupResultFlags, ServiceItem};
use std::fmt;
use std::sync::Arc;
use zbus::message::Message;

const OWNER: &str = "ServiceBrowser";

type ServicePayload = (i32, i32, String, String, String, u32);

pub struct ServiceBrowser {
    core: ProxyCore,
    item_new: Event<ServiceItem>,
    item_remove: Event<ServiceItem>,
    failure: Event<String>,
    all_for_now: Event<()>,
    cache_exhausted: Event<()>,
    error_log: Event<String>,
}

impl ServiceBrowser {
    pub(crate) async fn new(
        token: Token,
        session: Arc<Session>,
        bus: Arc<dyn BusConnection>,
        object_path: String,
    ) -> Result<Arc<Self>> {
        let browser = Arc::new(Self {
            core: ProxyCore::new(
                token,
                session,
                bus,
                object_path,
                INTERFACE_SERVICE_BROWSER,
                OWNER,
            ),
            item_new: Event::new(),
            item_remove: Event::new(),
            failure: Event::new(),
            all_for_now: Event::new(),
            cache_exhausted: Event::new(),
            error_log: Event::new(),
        });

        let weak = Arc::downgrade(&browser);
        let core = &browser.core;
        core.subscribe(
            "ItemNew",
            proxy::route(&weak, |browser: &Self, message: &Message| {
                browser.on_item("ItemNew", message, &browser.item_new)
            }),
        )
        .await?;
        core.subscribe(
            "ItemRemove",
            proxy::route(&weak, |browser: &Self, message: &Message| {
                browser.on_item("ItemRemove", message, &browser.item_remove)
            }),
        )
        .await?;
        core.subscribe("Failure", proxy::route(&weak, Self::on_failure))
            .await?;
        core.subscribe(
            "AllForNow",
            proxy::route(&weak, |browser: &Self, _: &Message| {
                browser.all_for_now.emit(&())
            }),
        )
        .await?;
        core.subscribe(
            "CacheExhausted",
            proxy::route(&weak, |browser: &Self, _: &Message| {
                browser.cache_exhausted.emit(&())
            }),
        )
        .await?;

        Ok(browser)
    }

    pub fn object_path(&self) -> &str {
        self.core.object_path()
    }

    /// Fired when a service instance shows up.
    pub fn item_new(&self) -> &Event<ServiceItem> {
        &self.item_new
    }

    pub fn item_remove(&self) -> &Event<ServiceItem> {
        &self.item_remove
    }

    pub fn failure(&self) -> &Event<String> {
        &self.failure
    }

    /// Fired when no more results are expected for a while.
    pub fn all_for_now(&self) -> &Event<()> {
        &self.all_for_now
    }

    pub fn cache_exhausted(&self) -> &Event<()> {
        &self.cache_exhausted
    }

    pub fn error_log(&self) -> &Event<String> {
        &self.error_log
    }

    fn on_item(&self, signal: &str, message: &Message, event: &Event<ServiceItem>) {
        let Some((interface, protocol, name, service_type, domain, flags)) =
            self.decode::<ServicePayload>(signal, message)
        else {
            return;
        };

        event.emit(&ServiceItem {
            interface,
            protocol,
            name,
            service_type,
            domain,
            flags: LookupResultFlags::from_bits_retain(flags),
        });
    }

    fn on_failure(&self, message: &Message) {
        if let Some(error) = self.decode::<String>("Failure", message) {
            self.failure.emit(&error);
        }
    }
}

impl fmt::Debug for ServiceBrowser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBrowser")
            .field("object_path", &self.object_path())
            .finish_non_exhaustive()
    }
}

impl ProxyObject for ServiceBrowser {
    const NEEDS_START: bool = true;

    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn error_log(&self) -> &Event<String> {
        &self.error_log
    }
}
