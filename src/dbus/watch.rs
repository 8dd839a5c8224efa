//! Presence watch for a well-known bus name.

use super::{Presence, ZbusConnection};
use crate::config::BusKind;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use zbus::connection::Builder;
use zbus::fdo::DBusProxy;
use zbus::names::BusName;
use zbus::Connection;

/// Open a connection to the system or session bus.
///
/// `queue_depth` is the number of incoming messages zbus queues before it
/// stops reading from the socket until the queue drains. Nothing is dropped.
pub async fn connect(kind: BusKind, queue_depth: usize) -> zbus::Result<Connection> {
    let builder = match kind {
        BusKind::System => Builder::system()?,
        BusKind::Session => Builder::session()?,
    };
    let connection = builder.max_queued(queue_depth).build().await?;
    debug!("Connected to the {} bus", kind);
    Ok(connection)
}

/// Change of presence derived from one owner update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Appeared,
    Vanished,
}

/// Tracks whether the watched name currently has an owner.
#[derive(Debug, Default)]
struct OwnerTracker {
    present: bool,
}

impl OwnerTracker {
    /// Transitions caused by an owner update. An owner handing the name
    /// straight to another yields a vanish followed by an appearance.
    fn update(&mut self, had_owner: bool, has_owner: bool) -> Vec<Transition> {
        let mut transitions = Vec::new();

        if self.present && had_owner {
            transitions.push(Transition::Vanished);
            self.present = false;
        }
        if !self.present && has_owner {
            transitions.push(Transition::Appeared);
            self.present = true;
        }

        transitions
    }
}

/// Forward `transitions`. Returns `false` once the receiver is gone.
async fn announce(
    tx: &mpsc::Sender<Presence>,
    connection: &Connection,
    name: &str,
    transitions: Vec<Transition>,
) -> bool {
    for transition in transitions {
        let presence = match transition {
            Transition::Appeared => {
                info!("{} appeared on the bus", name);
                Presence::Appeared(Arc::new(ZbusConnection::new(connection.clone())))
            }
            Transition::Vanished => {
                info!("{} vanished from the bus", name);
                Presence::Vanished
            }
        };
        if tx.send(presence).await.is_err() {
            return false;
        }
    }
    true
}

/// Watch `name` on `connection`.
///
/// Sends [`Presence::Appeared`] when the name has (or gets) an owner and
/// [`Presence::Vanished`] when it loses it. Each appearance gets a fresh
/// [`ZbusConnection`] handle so subscriptions of an earlier epoch are never
/// mixed up with the current one. The watch ends when the receiver is
/// dropped.
pub async fn watch_name(
    connection: Connection,
    name: &str,
) -> zbus::Result<mpsc::Receiver<Presence>> {
    let dbus = DBusProxy::new(&connection).await?;

    // Subscribe first so an owner change between the two calls is not lost.
    let mut changes = dbus
        .receive_name_owner_changed_with_args(&[(0, name)])
        .await?;
    let has_owner = dbus.name_has_owner(BusName::try_from(name)?).await?;

    let (tx, rx) = mpsc::channel(16);
    let name = name.to_string();

    tokio::spawn(async move {
        let mut tracker = OwnerTracker::default();

        if !announce(&tx, &connection, &name, tracker.update(false, has_owner)).await {
            return;
        }

        while let Some(signal) = changes.next().await {
            let args = match signal.args() {
                Ok(args) => args,
                Err(e) => {
                    debug!("Ignoring unreadable NameOwnerChanged: {}", e);
                    continue;
                }
            };

            let transitions =
                tracker.update(args.old_owner().is_some(), args.new_owner().is_some());
            if !announce(&tx, &connection, &name, transitions).await {
                return;
            }
        }

        debug!("Name watch for {} ended", name);
    });

    Ok(rx)
}
