mod error;
mod lifecycle;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;
mod validate;

pub use error::{
    AuthError, Conflict, EngineError, Entity, LifecycleError, LifecycleRule, Transition,
    ValidationError, ValidationRule,
};
pub use lifecycle::transition;
pub use validate::{validate, ValidatedBooking};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use validate::{email_key, name_key};

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Where a booking currently lives: room id and date.
pub(super) type BookingIndex = DashMap<Ulid, (Ulid, NaiveDate)>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
///
/// Blocks for the first append, drains whatever else is already queued,
/// then flushes and fsyncs once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        // Commands queued behind the batch observe it as committed.
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so a half-written batch does not
    // bleed into the next one.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// The booking engine: directories, per-room schedules and the WAL behind them.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) users: DashMap<Ulid, User>,
    /// Lowercased email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    /// Trimmed room name → room id.
    pub(super) room_names: DashMap<String, Ulid>,
    pub(super) booking_index: BookingIndex,
    /// Serialises directory writes so uniqueness checks and inserts are atomic.
    pub(super) directory: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
}

/// Apply a single-room event to a room's state (caller holds the write lock).
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &BookingIndex) {
    match event {
        Event::BookingCreated { booking } => {
            rs.insert_booking(booking.clone());
            index.insert(booking.id, (booking.room_id, booking.date));
        }
        Event::BookingUpdated { booking } => relocate_booking(None, rs, booking, index),
        Event::BookingStatusChanged { id, status, at, .. } => {
            let date = index.get(id).map(|e| e.value().1);
            if let Some(b) = date.and_then(|d| rs.booking_mut(*id, d)) {
                b.status = *status;
                b.modified_at = *at;
            }
        }
        Event::BookingDeleted { id, .. } => {
            if let Some((_, (_, date))) = index.remove(id) {
                rs.remove_booking(*id, date);
            }
        }
        Event::RoomUpdated { room } => rs.room = room.clone(),
        Event::UserDeleted { id } => strip_user_bookings(rs, *id, index),
        Event::RoomCreated { .. }
        | Event::RoomDeleted { .. }
        | Event::UserRegistered { .. }
        | Event::UserUpdated { .. } => {}
    }
}

/// Replace a booking with its edited version. `source` is the room it lived
/// in when that differs from `target`.
fn relocate_booking(
    source: Option<&mut RoomState>,
    target: &mut RoomState,
    booking: &Booking,
    index: &BookingIndex,
) {
    let previous = index.get(&booking.id).map(|e| e.value().1);
    if let Some(date) = previous {
        match source {
            Some(rs) => rs.remove_booking(booking.id, date),
            None => target.remove_booking(booking.id, date),
        };
    }
    target.insert_booking(booking.clone());
    index.insert(booking.id, (booking.room_id, booking.date));
}

fn strip_user_bookings(rs: &mut RoomState, user_id: Ulid, index: &BookingIndex) {
    for bookings in rs.days.values_mut() {
        bookings.retain(|b| {
            let keep = b.user_id != user_id;
            if !keep {
                index.remove(&b.id);
            }
            keep
        });
    }
    rs.days.retain(|_, bookings| !bookings.is_empty());
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            room_names: DashMap::new(),
            booking_index: DashMap::new(),
            directory: Mutex::new(()),
            wal_tx,
            notify,
            clock,
        };

        // Sole owner of every lock during replay, so try_write never fails.
        // Blocking lock calls are off limits: this may run on a runtime thread.
        for event in &events {
            engine.replay_event(event);
        }
        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::RoomCreated { room } => self.install_room(room.clone()),
            Event::RoomDeleted { id } => {
                if let Some(rs) = self.get_room_state(id)
                    && let Ok(guard) = rs.try_read()
                {
                    self.forget_room(&guard);
                }
            }
            Event::UserRegistered { user } | Event::UserUpdated { user } => {
                self.install_user(user.clone());
            }
            Event::UserDeleted { id } => {
                for rs in self.room_states_sorted() {
                    if let Ok(mut guard) = rs.try_write() {
                        apply_to_room(&mut guard, event, &self.booking_index);
                    }
                }
                self.forget_user(*id);
            }
            Event::BookingUpdated { booking } => {
                let source_id = self.booking_index.get(&booking.id).map(|e| e.value().0);
                let Some(target) = self.get_room_state(&booking.room_id) else {
                    warn!("replay: booking {} references missing room", booking.id);
                    return;
                };
                let Ok(mut target) = target.try_write() else { return };
                match source_id.filter(|sid| *sid != booking.room_id) {
                    Some(sid) => {
                        let source = self.get_room_state(&sid);
                        let mut source = source.as_ref().and_then(|rs| rs.try_write().ok());
                        relocate_booking(source.as_deref_mut(), &mut target, booking, &self.booking_index);
                    }
                    None => relocate_booking(None, &mut target, booking, &self.booking_index),
                }
            }
            Event::RoomUpdated { room } => {
                if let Some(rs) = self.get_room_state(&room.id)
                    && let Ok(mut guard) = rs.try_write()
                {
                    self.rename_room(&guard.room.name, room);
                    apply_to_room(&mut guard, event, &self.booking_index);
                }
            }
            Event::BookingCreated { booking } => self.replay_on_room(booking.room_id, event),
            Event::BookingStatusChanged { room_id, .. } | Event::BookingDeleted { room_id, .. } => {
                self.replay_on_room(*room_id, event);
            }
        }
    }

    fn replay_on_room(&self, room_id: Ulid, event: &Event) {
        if let Some(rs) = self.get_room_state(&room_id)
            && let Ok(mut guard) = rs.try_write()
        {
            apply_to_room(&mut guard, event, &self.booking_index);
        }
    }

    // ── Directory bookkeeping shared by replay and live writes ──

    pub(super) fn install_room(&self, room: Room) {
        self.room_names.insert(name_key(&room.name), room.id);
        self.rooms.insert(room.id, Arc::new(RwLock::new(RoomState::new(room))));
    }

    pub(super) fn rename_room(&self, old_name: &str, room: &Room) {
        self.room_names.remove(&name_key(old_name));
        self.room_names.insert(name_key(&room.name), room.id);
    }

    /// Drop a room and every index entry pointing at its bookings.
    pub(super) fn forget_room(&self, rs: &RoomState) {
        for booking in rs.bookings() {
            self.booking_index.remove(&booking.id);
        }
        self.room_names.remove(&name_key(&rs.room.name));
        self.rooms.remove(&rs.room.id);
    }

    pub(super) fn install_user(&self, user: User) {
        if let Some(previous) = self.users.get(&user.id).map(|u| u.email.clone()) {
            self.emails.remove(&email_key(&previous));
        }
        self.emails.insert(email_key(&user.email), user.id);
        self.users.insert(user.id, user);
    }

    pub(super) fn forget_user(&self, id: Ulid) {
        if let Some((_, user)) = self.users.remove(&id) {
            self.emails.remove(&email_key(&user.email));
        }
    }

    // ── Persistence helpers ──

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply to the room, notify its listeners.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.booking_index);
        self.notify.send(rs.room.id, event);
        Ok(())
    }

    /// Move an edited booking from `source` into `target` after logging it.
    pub(super) async fn persist_relocation(
        &self,
        source: &mut RoomState,
        target: &mut RoomState,
        booking: &Booking,
    ) -> Result<(), EngineError> {
        let event = Event::BookingUpdated {
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        relocate_booking(Some(source), target, booking, &self.booking_index);
        self.notify.send(source.room.id, &event);
        self.notify.send(target.room.id, &event);
        Ok(())
    }

    pub(super) fn strip_user(&self, rs: &mut RoomState, user_id: Ulid) {
        strip_user_bookings(rs, user_id, &self.booking_index);
    }

    // ── Lookups ──

    pub fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Every room's state, ordered by id. Locks must be taken in this order.
    pub(super) fn room_states_sorted(&self) -> Vec<SharedRoomState> {
        let mut entries: Vec<(Ulid, SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, rs)| rs).collect()
    }

    pub fn locate_booking(&self, id: &Ulid) -> Option<(Ulid, NaiveDate)> {
        self.booking_index.get(id).map(|e| *e.value())
    }

    /// Find a booking's room and take its write lock.
    ///
    /// Re-checks the index after locking: the booking may have moved, or its
    /// room may have been deleted, while this task waited.
    pub(super) async fn resolve_booking_write(
        &self,
        id: Ulid,
    ) -> Result<(NaiveDate, OwnedRwLockWriteGuard<RoomState>), EngineError> {
        loop {
            let (room_id, date) = self
                .locate_booking(&id)
                .ok_or(EngineError::not_found(Entity::Booking, id))?;
            let rs = self
                .get_room_state(&room_id)
                .ok_or(EngineError::not_found(Entity::Booking, id))?;
            let guard = rs.write_owned().await;
            match self.locate_booking(&id) {
                Some(found) if found == (room_id, date) => return Ok((date, guard)),
                Some(_) => continue,
                None => return Err(EngineError::not_found(Entity::Booking, id)),
            }
        }
    }
}
