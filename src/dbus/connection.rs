//! [`BusConnection`] backed by a zbus connection.

use super::{BusConnection, SignalHandler, SignalMatch, SubscriptionId};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zbus::message::{Message, Type as MessageType};
use zbus::{Connection, MatchRule, MessageStream};

const BUS_NAME: &str = "org.freedesktop.DBus";
const BUS_PATH: &str = "/org/freedesktop/DBus";

/// Routing table shared by a [`ZbusConnection`] and its pump task.
///
/// Signal handlers are kept in subscription order and replies are keyed by
/// the serial of the call they answer.
#[derive(Default)]
struct Router {
    next_id: u64,
    signals: BTreeMap<SubscriptionId, (SignalMatch, Arc<SignalHandler>)>,
    replies: HashMap<NonZeroU32, oneshot::Sender<Message>>,
}

impl Router {
    fn subscribe(&mut self, filter: SignalMatch, handler: SignalHandler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.signals.insert(id, (filter, Arc::new(handler)));
        id
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> Option<SignalMatch> {
        self.signals.remove(&id).map(|(filter, _)| filter)
    }

    fn expect_reply(&mut self, serial: NonZeroU32) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.replies.insert(serial, tx);
        rx
    }

    fn forget_reply(&mut self, serial: NonZeroU32) {
        self.replies.remove(&serial);
    }

    /// Hand a reply to its waiting call, or return the handlers a signal
    /// goes to.
    fn route(&mut self, message: &Message) -> Vec<Arc<SignalHandler>> {
        match message.message_type() {
            MessageType::MethodReturn | MessageType::Error => {
                let waiter = message
                    .header()
                    .reply_serial()
                    .and_then(|serial| self.replies.remove(&serial));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(message.clone());
                }
                Vec::new()
            }
            MessageType::Signal => self
                .signals
                .values()
                .filter(|(filter, _)| filter.matches(message))
                .map(|(_, handler)| handler.clone())
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn lock(router: &Mutex<Router>) -> MutexGuard<'_, Router> {
    router.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read `incoming` and dispatch every message in arrival order.
///
/// Handlers run on the pump task with the routing table unlocked, so they
/// may subscribe or unsubscribe. When the stream ends, calls still waiting
/// for a reply are failed.
async fn pump<S>(mut incoming: S, router: Arc<Mutex<Router>>)
where
    S: Stream<Item = zbus::Result<Message>> + Unpin,
{
    while let Some(message) = incoming.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unreadable message: {}", e);
                continue;
            }
        };

        let handlers = lock(&router).route(&message);
        for handler in handlers {
            handler(message.clone());
        }
    }

    debug!("Message stream closed");
    lock(&router).replies.clear();
}

/// Bus-side match rule string for `filter`.
fn match_rule(filter: &SignalMatch) -> zbus::Result<String> {
    let rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender(filter.sender.as_str())?
        .interface(filter.interface.as_str())?
        .member(filter.member.as_str())?
        .path(filter.path.as_str())?
        .build();
    Ok(rule.to_string())
}

/// `AddMatch` or `RemoveMatch` on the bus daemon.
async fn update_match(connection: &Connection, method: &str, rule: &str) -> zbus::Result<()> {
    connection
        .call_method(Some(BUS_NAME), BUS_PATH, Some(BUS_NAME), method, &rule)
        .await?;
    Ok(())
}

/// Connection handle for one epoch of the daemon's presence.
///
/// A single pump task reads the connection and routes replies and signals
/// in the order they arrive, so the signals of one object are seen in the
/// order the daemon sent them. Subscribing registers the match rule with the
/// bus; unsubscribing removes the route and, in the background, the rule.
pub struct ZbusConnection {
    connection: Connection,
    router: Arc<Mutex<Router>>,
    pump: JoinHandle<()>,
}

impl ZbusConnection {
    /// Wrap `connection`. Must be called inside a tokio runtime.
    pub fn new(connection: Connection) -> Self {
        let router = Arc::new(Mutex::new(Router::default()));
        let incoming = MessageStream::from(&connection);
        let pump = tokio::spawn(pump(incoming, router.clone()));

        Self {
            connection,
            router,
            pump,
        }
    }

    /// The underlying zbus connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn router(&self) -> MutexGuard<'_, Router> {
        lock(&self.router)
    }

    fn remove_match(&self, filter: &SignalMatch) {
        let rule = match match_rule(filter) {
            Ok(rule) => rule,
            Err(e) => {
                debug!("No match rule to remove for {}: {}", filter.member, e);
                return;
            }
        };

        match Handle::try_current() {
            Ok(runtime) => {
                let connection = self.connection.clone();
                runtime.spawn(async move {
                    if let Err(e) = update_match(&connection, "RemoveMatch", &rule).await {
                        debug!("RemoveMatch {} failed: {}", rule, e);
                    }
                });
            }
            Err(_) => debug!("No runtime left to remove match rule {}", rule),
        }
    }
}

#[async_trait]
impl BusConnection for ZbusConnection {
    async fn call(&self, message: Message) -> zbus::Result<Message> {
        let serial = message.primary_header().serial_num();

        // Register before sending so the reply cannot slip past the pump.
        let reply = self.router().expect_reply(serial);
        if let Err(e) = self.connection.send(&message).await {
            self.router().forget_reply(serial);
            return Err(e);
        }

        reply.await.map_err(|_| {
            zbus::Error::Failure("Connection closed before the reply arrived".into())
        })
    }

    async fn subscribe(
        &self,
        filter: SignalMatch,
        handler: SignalHandler,
    ) -> zbus::Result<SubscriptionId> {
        let rule = match_rule(&filter)?;
        let description = format!("{}.{} on {}", filter.interface, filter.member, filter.path);

        // Route first: the bus starts forwarding as soon as AddMatch is handled.
        let id = self.router().subscribe(filter, handler);
        if let Err(e) = update_match(&self.connection, "AddMatch", &rule).await {
            self.router().unsubscribe(id);
            return Err(e);
        }

        debug!("Subscribed {} to {}", id, description);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let filter = self.router().unsubscribe(id);
        match filter {
            Some(filter) => {
                debug!("Unsubscribed {}", id);
                self.remove_match(&filter);
            }
            None => warn!("Unsubscribe of unknown subscription {}", id),
        }
    }
}

impl Drop for ZbusConnection {
    fn drop(&mut self) {
        self.pump.abort();

        let leftovers: Vec<SignalMatch> = std::mem::take(&mut self.router().signals)
            .into_values()
            .map(|(filter, _)| filter)
            .collect();
        for filter in &leftovers {
            self.remove_match(filter);
        }
    }
}
