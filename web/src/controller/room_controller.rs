use crate::error::{Error, Result};
use crate::AppState;
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::*;
use serde::{Deserialize, Serialize};
use sse::beacon::find_beacon;
use sse::{Cleanup, Connection};
use store::Writable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMember {
    pub id: String,
}

/// POST join the shared room and stream its member list on the `users` event.
///
/// The member leaves when the stream closes, however it closes.
pub async fn join(
    State(app_state): State<AppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response> {
    // Beacons carry no body, so they are answered before it is parsed.
    if let Some(id) = find_beacon(query.as_deref()) {
        app_state.streams.beacon(&id);
        return Ok(StatusCode::OK.into_response());
    }

    let member: RoomMember = serde_json::from_slice(&body)?;
    if member.id.trim().is_empty() {
        return Err(Error::InvalidRequest("room member id is empty".to_string()));
    }

    let room = app_state.room.clone();
    Ok(app_state
        .streams
        .open_stream(&app_state.stream_options(), move |conn| {
            stay_in_room(room, member, conn)
        }))
}

async fn stay_in_room(
    room: Writable<Vec<RoomMember>>,
    member: RoomMember,
    conn: Connection,
) -> Option<Cleanup> {
    enter(&room, &member);
    info!("{} joined the room on stream {}", member.id, conn.id());

    let notify = conn.clone();
    let subscription = room.subscribe(move |members: &Vec<RoomMember>| {
        if let Err(e) = notify.emit_json("users", members) {
            debug!("Dropping room updates for stream {}: {}", notify.id(), e);
            notify.close();
        }
    });

    Some(Box::new(move || {
        subscription.cancel();
        room.update(|members| members.retain(|m| m.id != member.id));
        info!("{} left the room", member.id);
    }))
}

/// Adds `member`, replacing an existing entry with the same id.
fn enter(room: &Writable<Vec<RoomMember>>, member: &RoomMember) {
    room.update(|members| match members.iter_mut().find(|m| m.id == member.id) {
        Some(existing) => *existing = member.clone(),
        None => members.push(member.clone()),
    });
}
