//! In-memory stand-in for avahi-daemon, used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use avahi_async::codec::{
    INTERFACE_ENTRY_GROUP, INTERFACE_RECORD_BROWSER, INTERFACE_SERVER, INTERFACE_SERVICE_BROWSER,
    SERVER_PATH,
};
use avahi_async::dbus::{BusConnection, Presence, SignalHandler, SignalMatch, SubscriptionId};
use avahi_async::Client;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use zbus::message::Message;
use zbus::zvariant::{DynamicType, OwnedObjectPath};

pub const BAD_STATE: &str = "org.freedesktop.Avahi.BadStateError";
pub const INVALID_SERVICE_TYPE: &str = "org.freedesktop.Avahi.InvalidServiceTypeError";

#[derive(Default)]
struct State {
    next_id: u64,
    next_object: u32,
    /// Human-readable trace of calls and (un)subscriptions, in order.
    log: Vec<String>,
    calls: Vec<Message>,
    subscriptions: HashMap<SubscriptionId, (SignalMatch, Arc<SignalHandler>)>,
    /// Entry groups with at least one service.
    populated: HashSet<String>,
    failing: HashMap<String, (String, String)>,
    garbled: HashSet<String>,
    all_for_now_on_start: bool,
}

/// Fake daemon answering calls the way avahi-daemon would.
#[derive(Default)]
pub struct FakeDaemon {
    state: Mutex<State>,
}

impl FakeDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Answer `method` with a D-Bus error.
    pub fn fail(&self, method: &str, name: &str, message: &str) {
        self.state()
            .failing
            .insert(method.to_string(), (name.to_string(), message.to_string()));
    }

    /// Answer `method` with a body of the wrong type.
    pub fn garble(&self, method: &str) {
        self.state().garbled.insert(method.to_string());
    }

    /// Emit `AllForNow` from every browser as soon as it is started.
    pub fn announce_all_for_now_on_start(&self) {
        self.state().all_for_now_on_start = true;
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Log entries concerning `path`.
    pub fn log_for(&self, path: &str) -> Vec<String> {
        let needle = format!(" {} ", path);
        self.log()
            .into_iter()
            .filter(|entry| entry.contains(&needle))
            .collect()
    }

    pub fn calls(&self, method: &str) -> Vec<Message> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.header().member().map(|m| m.as_str()) == Some(method))
            .cloned()
            .collect()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls(method).len()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state().subscriptions.len()
    }

    /// Deliver a signal to every matching subscriber.
    pub fn emit<B>(&self, path: &str, interface: &str, member: &str, body: &B)
    where
        B: Serialize + DynamicType,
    {
        let message = Message::signal(path, interface, member)
            .unwrap()
            .build(body)
            .unwrap();
        self.deliver(message);
    }

    fn deliver(&self, message: Message) {
        let handlers: Vec<Arc<SignalHandler>> = self
            .state()
            .subscriptions
            .values()
            .filter(|(filter, _)| filter.matches(&message))
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(message.clone());
        }
    }

    fn next_object(&self, kind: &str) -> OwnedObjectPath {
        let mut state = self.state();
        state.next_object += 1;
        OwnedObjectPath::try_from(format!("/Client1/{}{}", kind, state.next_object)).unwrap()
    }

    fn reply(&self, call: &Message) -> Message {
        let header = call.header();
        let path = header.path().unwrap().as_str().to_string();
        let interface = header.interface().unwrap().as_str().to_string();
        let member = header.member().unwrap().as_str().to_string();

        let failing = self.state().failing.get(&member).cloned();
        if let Some((name, text)) = failing {
            return Message::error(&header, name.as_str())
                .unwrap()
                .build(&text)
                .unwrap();
        }
        if self.state().garbled.contains(&member) {
            return Message::method_return(&header)
                .unwrap()
                .build(&(true, 7u64))
                .unwrap();
        }

        let builder = Message::method_return(&header).unwrap();
        match (interface.as_str(), member.as_str()) {
            (INTERFACE_SERVER, "GetState") => builder.build(&2i32).unwrap(),
            (INTERFACE_SERVER, "GetHostName") => builder.build(&"fakehost").unwrap(),
            (INTERFACE_SERVER, "EntryGroupNew") => {
                builder.build(&self.next_object("EntryGroup")).unwrap()
            }
            (_, "RecordBrowserPrepare") => {
                builder.build(&self.next_object("RecordBrowser")).unwrap()
            }
            (_, "ServiceBrowserPrepare") => {
                builder.build(&self.next_object("ServiceBrowser")).unwrap()
            }
            (_, "ServiceResolverPrepare") => {
                builder.build(&self.next_object("ServiceResolver")).unwrap()
            }
            (INTERFACE_ENTRY_GROUP, "AddService") => {
                let (_, _, _, _, service_type, ..): (
                    i32,
                    i32,
                    u32,
                    String,
                    String,
                    String,
                    String,
                    u16,
                    Vec<Vec<u8>>,
                ) = call.body().deserialize().unwrap();
                if !service_type.starts_with('_') {
                    return Message::error(&header, INVALID_SERVICE_TYPE)
                        .unwrap()
                        .build(&"Invalid service type")
                        .unwrap();
                }
                self.state().populated.insert(path);
                builder.build(&()).unwrap()
            }
            (INTERFACE_ENTRY_GROUP, "Commit") => {
                if !self.state().populated.contains(&path) {
                    return Message::error(&header, BAD_STATE)
                        .unwrap()
                        .build(&"Bad state")
                        .unwrap();
                }
                let reply = builder.build(&()).unwrap();
                self.emit(&path, INTERFACE_ENTRY_GROUP, "StateChanged", &(1i32, ""));
                self.emit(&path, INTERFACE_ENTRY_GROUP, "StateChanged", &(2i32, ""));
                reply
            }
            (INTERFACE_ENTRY_GROUP, "Reset") => {
                self.state().populated.remove(&path);
                builder.build(&()).unwrap()
            }
            (INTERFACE_ENTRY_GROUP, "GetState") => builder.build(&0i32).unwrap(),
            (INTERFACE_ENTRY_GROUP, "IsEmpty") => {
                let empty = !self.state().populated.contains(&path);
                builder.build(&empty).unwrap()
            }
            (_, "Start") => {
                let reply = builder.build(&()).unwrap();
                let announce = self.state().all_for_now_on_start;
                if announce
                    && (interface == INTERFACE_RECORD_BROWSER
                        || interface == INTERFACE_SERVICE_BROWSER)
                {
                    self.emit(&path, &interface, "AllForNow", &());
                }
                reply
            }
            _ => builder.build(&()).unwrap(),
        }
    }
}

#[async_trait]
impl BusConnection for FakeDaemon {
    async fn call(&self, message: Message) -> zbus::Result<Message> {
        {
            let header = message.header();
            let entry = format!(
                "call {} {}",
                header.path().unwrap().as_str(),
                header.member().unwrap().as_str()
            );
            let mut state = self.state();
            state.log.push(entry);
            state.calls.push(message.clone());
        }
        Ok(self.reply(&message))
    }

    async fn subscribe(
        &self,
        filter: SignalMatch,
        handler: SignalHandler,
    ) -> zbus::Result<SubscriptionId> {
        let mut state = self.state();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        let entry = format!("subscribe {} {}", filter.path, filter.member);
        state.log.push(entry);
        state.subscriptions.insert(id, (filter, Arc::new(handler)));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state();
        if let Some((filter, _)) = state.subscriptions.remove(&id) {
            let entry = format!("unsubscribe {} {}", filter.path, filter.member);
            state.log.push(entry);
        }
    }
}

/// A client plus the presence channel driving it.
pub struct Harness {
    pub client: Client,
    pub presence: mpsc::Sender<Presence>,
}

impl Harness {
    pub fn new() -> Self {
        let (presence, rx) = mpsc::channel(8);
        Self {
            client: Client::new(rx),
            presence,
        }
    }

    /// Let `daemon` appear and wait until the client has connected.
    pub async fn appear(&self, daemon: &Arc<FakeDaemon>) {
        let bus: Arc<dyn BusConnection> = daemon.clone();
        self.presence.send(Presence::Appeared(bus)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.client.wait_connected())
            .await
            .expect("client did not connect");
    }

    pub async fn vanish(&self) {
        self.presence.send(Presence::Vanished).await.unwrap();
        eventually(|| !self.client.is_connected()).await;
    }
}

/// Connected client over a fresh fake daemon.
pub async fn connected() -> (Harness, Arc<FakeDaemon>) {
    let harness = Harness::new();
    let daemon = FakeDaemon::new();
    harness.appear(&daemon).await;
    (harness, daemon)
}

/// Wait until `condition` holds, giving spawned tasks the chance to run.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

/// Let pending tasks run for a moment.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub type Completion<T> = Box<dyn FnOnce(avahi_async::Result<T>) + Send>;

/// Completion that forwards its result to a oneshot receiver.
pub fn completion<T: Send + 'static>() -> (
    Completion<T>,
    tokio::sync::oneshot::Receiver<avahi_async::Result<T>>,
) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let done: Completion<T> = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (done, rx)
}

/// Counts invocations of a completion or event handler.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Server-level `StateChanged` on `/`.
pub fn emit_server_state<B: Serialize + DynamicType>(daemon: &FakeDaemon, body: &B) {
    daemon.emit(SERVER_PATH, INTERFACE_SERVER, "StateChanged", body);
}
