//! Newline-delimited JSON protocol.
//!
//! Each request is one JSON object tagged by `op`; each reply is one line,
//! either `{"ok":true,"data":..}` or `{"ok":false,"error":{..}}`. A connection
//! starts anonymous and becomes a user with `login`. Rooms a connection
//! `listen`s to push `{"notify":{"room_id":..,"event":..}}` lines as they
//! change.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::Authenticator;
use crate::engine::{AuthError, Conflict, Engine, EngineError, Entity};
use crate::limits::MAX_FRAME_LEN;
use crate::model::*;
use crate::observability::{self, AUTH_FAILURES_TOTAL, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::policy::{authorize, Operation};

const NOTIFY_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Login {
        email: String,
        password: String,
    },
    Whoami,

    CreateRoom {
        room: RoomDraft,
    },
    UpdateRoom {
        id: Ulid,
        room: RoomDraft,
    },
    DeleteRoom {
        id: Ulid,
    },
    GetRoom {
        id: Ulid,
    },
    ListRooms {
        #[serde(default)]
        filter: RoomFilter,
    },

    RegisterUser {
        user: UserDraft,
    },
    UpdateUser {
        id: Ulid,
        user: UserDraft,
    },
    DeleteUser {
        id: Ulid,
    },
    GetUser {
        id: Ulid,
    },
    ListUsers,

    CreateBooking {
        booking: BookingDraft,
    },
    UpdateBooking {
        id: Ulid,
        booking: BookingDraft,
    },
    ConfirmBooking {
        id: Ulid,
    },
    CancelBooking {
        id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    GetBooking {
        id: Ulid,
    },
    ListBookings {
        #[serde(default)]
        filter: BookingFilter,
    },
    RoomBookings {
        room_id: Ulid,
    },
    UserBookings {
        user_id: Ulid,
    },
    TodayBookings,
    PendingBookings,
    FindConflicts {
        room_id: Ulid,
        date: NaiveDate,
        #[serde(default)]
        exclude: Option<Ulid>,
    },

    Listen {
        room_id: Ulid,
    },
    Unlisten {
        room_id: Ulid,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    /// The request field the error is about, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting: Option<Conflict>,
}

impl From<&EngineError> for ErrorBody {
    fn from(e: &EngineError) -> Self {
        let (field, conflicting) = match e {
            EngineError::Validation(v) => (Some(v.rule.field()), v.conflicting),
            EngineError::InvalidField { field, .. } | EngineError::Duplicate { field, .. } => {
                (Some(*field), None)
            }
            _ => (None, None),
        };
        Self {
            code: e.code(),
            message: e.to_string(),
            field,
            conflicting,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    fn data(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(error: ErrorBody) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::error(ErrorBody {
            code: "bad_request",
            message: message.into(),
            field: None,
            conflicting: None,
        })
    }
}

#[derive(Serialize)]
struct Notification<'a> {
    room_id: Ulid,
    event: &'a Event,
}

fn to_json<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// A booking as clients see it: the stored record plus its length in hours.
#[derive(Serialize)]
struct BookingView<'a> {
    #[serde(flatten)]
    booking: &'a Booking,
    duration_hours: f64,
}

impl<'a> From<&'a Booking> for BookingView<'a> {
    fn from(booking: &'a Booking) -> Self {
        Self {
            booking,
            duration_hours: booking.slot.hours(),
        }
    }
}

fn booking_json(booking: &Booking) -> Value {
    to_json(BookingView::from(booking))
}

fn bookings_json(bookings: &[Booking]) -> Value {
    to_json(bookings.iter().map(BookingView::from).collect::<Vec<_>>())
}

fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| r#"{"ok":false,"error":{"code":"internal","message":"encode failed"}}"#.into())
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Per-connection state.
struct Session {
    engine: Arc<Engine>,
    auth: Arc<Authenticator>,
    user_id: Option<Ulid>,
    listeners: HashMap<Ulid, JoinHandle<()>>,
    notify_tx: mpsc::Sender<(Ulid, Event)>,
}

impl Session {
    /// Re-read on every request so role changes and deletions apply at once.
    fn actor(&self) -> Option<Actor> {
        let id = self.user_id?;
        self.engine.get_user(id).ok().map(|u| Actor::from(&u))
    }

    async fn handle_line(&mut self, line: &str) -> Reply {
        let cmd: Command = match serde_json::from_str(line) {
            Ok(cmd) => cmd,
            Err(e) => return Reply::bad_request(format!("invalid request: {e}")),
        };
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute(cmd).await;
        metrics::histogram!(REQUEST_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(REQUESTS_TOTAL, "command" => label, "status" => status).increment(1);
        match result {
            Ok(data) => Reply::data(data),
            Err(e) => {
                if !e.is_rejection() {
                    warn!("{label} failed: {e}");
                }
                Reply::error(ErrorBody::from(&e))
            }
        }
    }

    async fn execute(&mut self, cmd: Command) -> Result<Value, EngineError> {
        let engine = self.engine.clone();
        let actor = self.actor();
        let actor = actor.as_ref();
        match cmd {
            Command::Login { email, password } => {
                let user = self.auth.login(&engine, &email, &password).inspect_err(|_| {
                    metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                })?;
                info!(user = %user.id, "login");
                self.user_id = Some(user.id);
                Ok(to_json(user))
            }
            Command::Whoami => {
                let actor = actor.ok_or(AuthError::NotAuthenticated)?;
                Ok(to_json(engine.get_user(actor.user_id)?))
            }

            Command::CreateRoom { room } => Ok(to_json(engine.create_room(room, actor).await?)),
            Command::UpdateRoom { id, room } => {
                Ok(to_json(engine.update_room(id, room, actor).await?))
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id, actor).await?;
                Ok(Value::Null)
            }
            Command::GetRoom { id } => {
                authorize(actor, Operation::ReadRooms, None)?;
                Ok(to_json(engine.get_room(id).await?))
            }
            Command::ListRooms { filter } => {
                authorize(actor, Operation::ReadRooms, None)?;
                Ok(to_json(engine.list_rooms(&filter).await))
            }

            Command::RegisterUser { user } => {
                Ok(to_json(engine.register_user(user, actor).await?))
            }
            Command::UpdateUser { id, user } => {
                Ok(to_json(engine.update_user(id, user, actor).await?))
            }
            Command::DeleteUser { id } => {
                engine.delete_user(id, actor).await?;
                Ok(Value::Null)
            }
            Command::GetUser { id } => {
                authorize(actor, Operation::ReadUser, Some(id))?;
                Ok(to_json(engine.get_user(id)?))
            }
            Command::ListUsers => {
                authorize(actor, Operation::ListUsers, None)?;
                Ok(to_json(engine.list_users()))
            }

            Command::CreateBooking { booking } => {
                Ok(booking_json(&engine.create_booking(booking, actor).await?))
            }
            Command::UpdateBooking { id, booking } => {
                Ok(booking_json(&engine.update_booking(id, booking, actor).await?))
            }
            Command::ConfirmBooking { id } => Ok(booking_json(&engine.confirm_booking(id, actor).await?)),
            Command::CancelBooking { id } => Ok(booking_json(&engine.cancel_booking(id, actor).await?)),
            Command::DeleteBooking { id } => {
                engine.delete_booking(id, actor).await?;
                Ok(Value::Null)
            }
            Command::GetBooking { id } => {
                authorize(actor, Operation::ReadBookings, None)?;
                Ok(booking_json(&engine.get_booking(id).await?))
            }
            Command::ListBookings { filter } => {
                authorize(actor, Operation::ReadBookings, None)?;
                Ok(bookings_json(&engine.list_bookings(&filter).await))
            }
            Command::RoomBookings { room_id } => {
                authorize(actor, Operation::ReadBookings, None)?;
                Ok(bookings_json(&engine.room_bookings(room_id).await?))
            }
            Command::UserBookings { user_id } => {
                authorize(actor, Operation::ReadBookings, None)?;
                Ok(bookings_json(&engine.user_bookings(user_id).await?))
            }
            Command::TodayBookings => {
                authorize(actor, Operation::ReadBookings, None)?;
                Ok(bookings_json(&engine.bookings_for_today().await))
            }
            Command::PendingBookings => {
                authorize(actor, Operation::ReadBookings, None)?;
                Ok(bookings_json(&engine.pending_bookings().await))
            }
            Command::FindConflicts {
                room_id,
                date,
                exclude,
            } => {
                authorize(actor, Operation::ReadBookings, None)?;
                Ok(bookings_json(
                    &engine.find_active_conflicts(room_id, date, exclude).await?,
                ))
            }

            Command::Listen { room_id } => {
                authorize(actor, Operation::ReadBookings, None)?;
                if engine.get_room_state(&room_id).is_none() {
                    return Err(EngineError::not_found(Entity::Room, room_id));
                }
                self.listen(room_id);
                Ok(Value::Null)
            }
            Command::Unlisten { room_id } => {
                if let Some(handle) = self.listeners.remove(&room_id) {
                    handle.abort();
                }
                Ok(Value::Null)
            }
        }
    }

    /// Forward a room's events into this connection's outbound queue.
    fn listen(&mut self, room_id: Ulid) {
        if self.listeners.contains_key(&room_id) {
            return;
        }
        let mut rx = self.engine.notify.subscribe(room_id);
        let tx = self.notify_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send((room_id, event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("listener on room {room_id} lagged, {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.insert(room_id, handle);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, handle) in self.listeners.drain() {
            handle.abort();
        }
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(
    stream: S,
    engine: Arc<Engine>,
    auth: Arc<Authenticator>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    let (notify_tx, mut notify_rx) = mpsc::channel(NOTIFY_BUFFER);
    let mut session = Session {
        engine,
        auth,
        user_id: None,
        listeners: HashMap::new(),
        notify_tx,
    };

    loop {
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = Reply::bad_request(format!("request exceeds {MAX_FRAME_LEN} bytes"));
                        framed.send(encode(&reply)).await.map_err(codec_err)?;
                        continue;
                    }
                    Some(Err(e)) => return Err(codec_err(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = session.handle_line(&line).await;
                framed.send(encode(&reply)).await.map_err(codec_err)?;
            }
            Some((room_id, event)) = notify_rx.recv() => {
                let line = encode(&serde_json::json!({
                    "notify": Notification { room_id, event: &event }
                }));
                framed.send(line).await.map_err(codec_err)?;
            }
        }
    }
    debug!("connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_commands() {
        let cmd: Command = serde_json::from_str(r#"{"op":"whoami"}"#).unwrap();
        assert_eq!(cmd, Command::Whoami);

        let cmd: Command =
            serde_json::from_str(r#"{"op":"list_rooms","filter":{"min_capacity":6}}"#).unwrap();
        assert_eq!(
            cmd,
            Command::ListRooms {
                filter: RoomFilter {
                    available_only: false,
                    min_capacity: Some(6)
                }
            }
        );

        let cmd: Command = serde_json::from_str(r#"{"op":"list_bookings"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::ListBookings {
                filter: BookingFilter::default()
            }
        );
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"op":"drop_table"}"#).is_err());
    }

    #[test]
    fn error_body_carries_conflict() {
        let slot = TimeSlot::new(
            chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            chrono::NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
        );
        let id = Ulid::new();
        let err = EngineError::from(crate::engine::ValidationError::conflict(id, slot));
        let json = to_json(Reply::error(ErrorBody::from(&err)));
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "schedule_conflict");
        assert_eq!(json["error"]["field"], "schedule");
        assert_eq!(json["error"]["conflicting"]["booking_id"], id.to_string());
        assert_eq!(json["error"]["conflicting"]["slot"]["start"], "09:00:00");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn auth_errors_have_stable_codes() {
        let body = ErrorBody::from(&EngineError::from(AuthError::NotAdmin));
        assert_eq!(body.code, "not_admin");
        assert!(body.field.is_none());
        assert!(body.conflicting.is_none());
    }
}
