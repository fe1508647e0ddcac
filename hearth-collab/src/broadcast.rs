//! Connection registry and filtered fan-out.
//!
//! Every live WebSocket session is a [`Connection`] with its own unbounded
//! outbound queue drained by a single writer task. Broadcasting walks the
//! registry, picks the members whose [`Subscription`] intersects the event's
//! mask and enqueues the pre-encoded frame. Enqueueing never blocks, so a
//! slow client cannot hold up a mutation that is broadcasting under its lock.
//!
//! Lock order: registry membership, then the current map pointer, then any
//! connection's session lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use hearth_core::{Change, ItemId};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{encode_push, push};

bitflags! {
    /// Event classes a connection receives.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Subscription: u32 {
        const FOLDERS = 1;
        const ADMIN_MAP = 1 << 1;
        const GUEST_MAP = 1 << 2;
        const ADMIN_KEYS = 1 << 3;
        const GUEST_KEYS = 1 << 4;
        const CURRENT_MAP = 1 << 5;
    }
}

impl Subscription {
    pub fn for_role(admin: bool) -> Self {
        if admin {
            Self::FOLDERS | Self::ADMIN_MAP | Self::ADMIN_KEYS
        } else {
            Self::GUEST_MAP | Self::GUEST_KEYS | Self::CURRENT_MAP
        }
    }

    fn is_map_scoped(self) -> bool {
        self.intersects(Self::ADMIN_MAP | Self::GUEST_MAP)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Session {
    admin: bool,
    current_map: Option<ItemId>,
}

/// One live client session.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    session: RwLock<Session>,
    outbound: mpsc::UnboundedSender<Arc<str>>,
}

impl Connection {
    pub fn new(admin: bool, current_map: Option<ItemId>) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<str>>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            session: RwLock::new(Session { admin, current_map }),
            outbound,
        });
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_admin(&self) -> bool {
        self.session.read().admin
    }

    pub fn current_map(&self) -> Option<ItemId> {
        self.session.read().current_map
    }

    pub fn set_current_map(&self, map: Option<ItemId>) {
        self.session.write().current_map = map;
    }

    fn set_admin(&self, admin: bool) {
        self.session.write().admin = admin;
    }

    /// Queue a frame; false once the writer has gone away.
    pub fn send(&self, frame: Arc<str>) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub fn push(&self, id: i64, payload: &Value) -> bool {
        self.send(encode_push(id, payload))
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

struct Member {
    conn: Arc<Connection>,
    mask: Subscription,
}

/// Where a broadcast goes.
#[derive(Debug, Clone, Copy)]
pub struct Audience {
    pub mask: Subscription,
    /// Restrict delivery of map-scoped events to connections showing this map.
    pub map: Option<ItemId>,
    /// The originating connection, which gets its reply instead.
    pub except: Option<Uuid>,
}

impl Audience {
    pub fn new(mask: Subscription, except: Option<Uuid>) -> Self {
        Self { mask, map: None, except }
    }

    pub fn on_map(mut self, map: ItemId) -> Self {
        self.map = Some(map);
        self
    }
}

pub struct ConnectionRegistry {
    members: RwLock<HashMap<Uuid, Member>>,
    current_map: RwLock<Option<ItemId>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            current_map: RwLock::new(None),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Map shown to guests.
    pub fn current_map(&self) -> Option<ItemId> {
        *self.current_map.read()
    }

    /// Add a connection with the mask for its role and push its greeting:
    /// guests are pointed at the current map and told which it is, admins
    /// get their status.
    pub fn register(&self, conn: Arc<Connection>) {
        let admin = conn.is_admin();
        let mask = Subscription::for_role(admin);
        let mut members = self.members.write();
        if admin {
            conn.push(push::ADMIN_STATUS, &json!(true));
        } else {
            let current = self.current_map();
            conn.set_current_map(current);
            conn.push(push::CURRENT_MAP, &json!(current));
        }
        members.insert(conn.id(), Member { conn, mask });
    }

    pub fn deregister(&self, id: &Uuid) -> bool {
        self.members.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.members.read().get(id).map(|m| m.conn.clone())
    }

    /// Switch a connection between admin and guest, swapping its mask.
    pub fn set_role(&self, conn: &Connection, admin: bool) {
        let mut members = self.members.write();
        if let Some(member) = members.get_mut(&conn.id()) {
            member.mask = Subscription::for_role(admin);
        }
        conn.set_admin(admin);
        if !admin {
            conn.set_current_map(self.current_map());
        }
    }

    /// Enqueue `frame` on every matching connection; returns the number of
    /// connections reached.
    pub fn broadcast(&self, audience: Audience, frame: &Arc<str>) -> usize {
        let members = self.members.read();
        let mut sent = 0;
        for (id, member) in members.iter() {
            if Some(*id) == audience.except || !member.mask.intersects(audience.mask) {
                continue;
            }
            if let Some(map) = audience.map {
                if audience.mask.is_map_scoped() && member.conn.current_map() != Some(map) {
                    continue;
                }
            }
            if member.conn.send(frame.clone()) {
                sent += 1;
            } else {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        sent
    }

    pub fn push(&self, audience: Audience, id: i64, payload: &Value) -> usize {
        self.broadcast(audience, &encode_push(id, payload))
    }

    /// Send the admin payload to `admin` and the guest payload, if any, to
    /// `guest`.
    pub fn push_change(&self, id: i64, change: &Change, admin: Audience, guest: Audience) {
        self.push(admin, id, &change.admin);
        if let Some(payload) = &change.guest {
            self.push(guest, id, payload);
        }
    }

    /// Demote every admin except `except` and tell them they were logged out.
    pub fn kick_admins(&self, except: Uuid) -> usize {
        let mut members = self.members.write();
        let current = self.current_map();
        let mut kicked = 0;
        for (id, member) in members.iter_mut() {
            if *id == except || !member.conn.is_admin() {
                continue;
            }
            member.mask = Subscription::for_role(false);
            member.conn.set_admin(false);
            member.conn.set_current_map(current);
            member.conn.push(push::LOGGED_OUT, &Value::Null);
            kicked += 1;
        }
        kicked
    }

    /// Point every guest at `map` and push the change to them.
    pub fn set_current_map(&self, map: Option<ItemId>) -> usize {
        let members = self.members.read();
        *self.current_map.write() = map;
        let mut updated = 0;
        for member in members.values() {
            if member.conn.is_admin() {
                continue;
            }
            member.conn.set_current_map(map);
            member.conn.push(push::CURRENT_MAP, &json!(map));
            updated += 1;
        }
        updated
    }

    /// True when a map is shown to guests or selected by any connection.
    pub fn is_map_in_use(&self, map: ItemId) -> bool {
        if self.current_map() == Some(map) {
            return true;
        }
        self.members
            .read()
            .values()
            .any(|m| m.conn.current_map() == Some(map))
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.len(),
        }
    }
}
