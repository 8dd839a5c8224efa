//! Entry group proxy, used to publish services.
//!
//! Services are added to a group, then committed together. The daemon
//! reports registration progress and name collisions through
//! [`EntryGroup::state_changed`].

use crate::client::Session;
use crate::codec::{self, INTERFACE_ENTRY_GROUP};
use crate::dbus::BusConnection;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::proxy::{self, ProxyCore, ProxyObject, Token};
use crate::types::{EntryGroupState, Interface, Port, Protocol, PublishFlags};
use std::sync::Arc;
use tracing::debug;
use zbus::message::Message;

const OWNER: &str = "EntryGroup";

pub struct EntryGroup {
    core: ProxyCore,
    state_changed: Event<(EntryGroupState, String)>,
    error_log: Event<String>,
}

impl EntryGroup {
    pub(crate) async fn new(
        token: Token,
        session: Arc<Session>,
        bus: Arc<dyn BusConnection>,
        object_path: String,
    ) -> Result<Arc<Self>> {
        let group = Arc::new(Self {
            core: ProxyCore::new(
                token,
                session,
                bus,
                object_path,
                INTERFACE_ENTRY_GROUP,
                OWNER,
            ),
            state_changed: Event::new(),
            error_log: Event::new(),
        });

        let weak = Arc::downgrade(&group);
        group
            .core
            .subscribe("StateChanged", proxy::route(&weak, Self::on_state_changed))
            .await?;

        Ok(group)
    }

    /// Object path of the group on the daemon.
    pub fn object_path(&self) -> &str {
        self.core.object_path()
    }

    /// Fired with the new group state and an error description.
    pub fn state_changed(&self) -> &Event<(EntryGroupState, String)> {
        &self.state_changed
    }

    /// Fired with a description of every malformed signal or failed `Start`.
    pub fn error_log(&self) -> &Event<String> {
        &self.error_log
    }

    fn on_state_changed(&self, message: &Message) {
        let Some((raw, error)) = self.decode::<(i32, String)>("StateChanged", message) else {
            return;
        };
        match EntryGroupState::from_raw(raw) {
            Some(state) => {
                debug!("{} is now {}", self.core.object_path(), state);
                self.state_changed.emit(&(state, error));
            }
            None => self.malformed("StateChanged"),
        }
    }

    /// Add a service. `domain` and `host` may be empty to use the defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn add_service<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        flags: PublishFlags,
        name: &str,
        service_type: &str,
        domain: &str,
        host: &str,
        port: Port,
        txt: &[Vec<u8>],
        completion: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let args = (
            interface,
            protocol,
            flags.bits(),
            name,
            service_type,
            domain,
            host,
            port,
            txt,
        );
        self.core
            .call("AddService", &args)
            .spawn(codec::no_reply, completion);
    }

    /// Register `subtype` for a service previously added to this group.
    #[allow(clippy::too_many_arguments)]
    pub fn add_service_subtype<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        flags: PublishFlags,
        name: &str,
        service_type: &str,
        domain: &str,
        subtype: &str,
        completion: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let args = (
            interface,
            protocol,
            flags.bits(),
            name,
            service_type,
            domain,
            subtype,
        );
        self.core
            .call("AddServiceSubtype", &args)
            .spawn(codec::no_reply, completion);
    }

    /// Replace the TXT data of an already published service.
    #[allow(clippy::too_many_arguments)]
    pub fn update_service_txt<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        flags: PublishFlags,
        name: &str,
        service_type: &str,
        domain: &str,
        txt: &[Vec<u8>],
        completion: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let args = (
            interface,
            protocol,
            flags.bits(),
            name,
            service_type,
            domain,
            txt,
        );
        self.core
            .call("UpdateServiceTxt", &args)
            .spawn(codec::no_reply, completion);
    }

    /// Register the entries added so far.
    pub fn commit<F>(&self, completion: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.core.call("Commit", &()).spawn(codec::no_reply, completion);
    }

    /// Withdraw and remove all entries.
    pub fn reset<F>(&self, completion: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.core.call("Reset", &()).spawn(codec::no_reply, completion);
    }

    pub fn get_state<F>(&self, completion: F)
    where
        F: FnOnce(Result<EntryGroupState>) + Send + 'static,
    {
        self.core.call("GetState", &()).spawn(
            |reply| {
                let raw: i32 = codec::parse_reply(OWNER, "GetState", reply)?;
                EntryGroupState::from_raw(raw).ok_or_else(|| {
                    Error::Parse(format!("{}: Cannot parse response to \"GetState\"", OWNER))
                })
            },
            completion,
        );
    }

    pub fn is_empty<F>(&self, completion: F)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        self.core
            .call("IsEmpty", &())
            .spawn(|reply| codec::parse_reply(OWNER, "IsEmpty", reply), completion);
    }
}

impl ProxyObject for EntryGroup {
    const NEEDS_START: bool = false;

    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn error_log(&self) -> &Event<String> {
        &self.error_log
    }
}
