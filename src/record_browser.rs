//! Record browser proxy.
//!
//! Reports raw resource records of one name, class and type as they appear
//! and disappear on the network.

use crate::client::Session;
use crate::codec::INTERFACE_RECORD_BROWSER;
use crate::dbus::BusConnection;
use crate::error::Result;
use crate::event::Event;
use crate::proxy::{self, ProxyCore, ProxyObject, Token};
use crate::types::{LookupResultFlags, RecordItem};
use std::sync::Arc;
use zbus::message::Message;

const OWNER: &str = "RecordBrowser";

type RecordPayload = (i32, i32, String, u16, u16, Vec<u8>, u32);

pub struct RecordBrowser {
    core: ProxyCore,
    item_new: Event<RecordItem>,
    item_remove: Event<RecordItem>,
    failure: Event<String>,
    all_for_now: Event<()>,
    cache_exhausted: Event<()>,
    error_log: Event<String>,
}

impl RecordBrowser {
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
                INTERFACE_RECORD_BROWSER,
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

    pub fn item_new(&self) -> &Event<RecordItem> {
        &self.item_new
    }

    pub fn item_remove(&self) -> &Event<RecordItem> {
        &self.item_remove
    }

    /// Fired with the daemon's error message when browsing fails.
    pub fn failure(&self) -> &Event<String> {
        &self.failure
    }

    /// Fired once the initial burst of results has been delivered.
    pub fn all_for_now(&self) -> &Event<()> {
        &self.all_for_now
    }

    pub fn cache_exhausted(&self) -> &Event<()> {
        &self.cache_exhausted
    }

    pub fn error_log(&self) -> &Event<String> {
        &self.error_log
    }

    fn on_item(&self, signal: &str, message: &Message, event: &Event<RecordItem>) {
        let Some((interface, protocol, name, class, record_type, data, flags)) =
            self.decode::<RecordPayload>(signal, message)
        else {
            return;
        };

        event.emit(&RecordItem {
            interface,
            protocol,
            name,
            class,
            record_type,
            data,
            flags: LookupResultFlags::from_bits_retain(flags),
        });
    }

    fn on_failure(&self, message: &Message) {
        if let Some(error) = self.decode::<String>("Failure", message) {
            self.failure.emit(&error);
        }
    }
}

impl ProxyObject for RecordBrowser {
    const NEEDS_START: bool = true;

    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn error_log(&self) -> &Event<String> {
        &self.error_log
    }
}
