//! Event classification and payload transforms.
//!
//! A static table maps raw wire commands to canonical [`EventKind`]s; each
//! known command has a transform producing zero, one, or many typed
//! payloads (a fan-out message like "users entered" yields one payload per
//! user). Unknown wire commands are silently ignored.
//!
//! Transforms are the single place where push messages mutate the entity
//! scopes: role membership changes, attribute merges, and current-song
//! tracking all happen here, before any handler runs. Some transforms
//! synthesize additional events. Receiving a new song (or "no song
//! available") first emits `song_ended` for the song that was playing, so
//! downstream consumers can rely on end-before-start ordering, and a user
//! update fans out into the detail events describing exactly what changed.

use serde_json::{json, Value};

use crate::entity::{extract_id, Entity, EntityKind};
use crate::message::Inbound;
use crate::scope::{RoomScope, Scopes};

/// Canonical event identifiers exposed to handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An authenticated session is missing; the supervisor authenticates.
    SessionMissing,
    /// The server asked this client to disconnect.
    SessionEndRequested,
    /// The connection has closed.
    SessionEnded,
    /// The client reconnected after a connection loss.
    Reconnected,
    /// A liveness probe was received (and acknowledged by the transport).
    Heartbeat,
    /// A response arrived for which no call was waiting.
    ResponseReceived,
    /// Information about the room was updated.
    RoomUpdated,
    /// A user entered the room (fan-out per user).
    UserEntered,
    /// A user left the room (fan-out per user).
    UserLeft,
    /// A user was booted from the room.
    UserBooted,
    /// A user's name / profile was updated.
    UserUpdated,
    /// Detail event: the user's name changed.
    UserNameUpdated,
    /// Detail event: the user's avatar changed.
    UserAvatarUpdated,
    /// A user's sticker placements were updated.
    UserStickersUpdated,
    /// A user spoke in the chat room.
    UserSpoke,
    /// Detail event: a user gained a fan.
    FanAdded,
    /// Detail event: a user lost fans.
    FanRemoved,
    /// A DJ stepped up to the decks.
    DjAdded,
    /// A DJ left the decks.
    DjRemoved,
    /// Detail event: a DJ was escorted off by a moderator.
    DjEscortedOff,
    /// Detail event: a DJ was booed off.
    DjBooedOff,
    /// A moderator was appointed.
    ModeratorAdded,
    /// A moderator was removed.
    ModeratorRemoved,
    /// No more songs are queued in the room.
    SongUnavailable,
    /// A new song started playing.
    SongStarted,
    /// The current song ended (often synthesized before a start).
    SongEnded,
    /// Votes were cast for the current song.
    SongVoted,
    /// A user queued the current song onto their own playlist.
    SongSnagged,
    /// A song was skipped due to a copyright claim.
    SongBlocked,
    /// A song was skipped due to a play-per-hour limit.
    SongLimited,
    /// A private message arrived.
    MessageReceived,
    /// A song search finished with results.
    SearchCompleted,
    /// A song search failed.
    SearchFailed,
}

/// wire command → canonical event. Detail events (`fan_added`,
/// `dj_booed_off`, …) have no wire command of their own; they are only
/// synthesized by transforms.
static COMMANDS: &[(&str, EventKind)] = &[
    ("no_session", EventKind::SessionMissing),
    ("killdashnine", EventKind::SessionEndRequested),
    ("session_ended", EventKind::SessionEnded),
    ("reconnected", EventKind::Reconnected),
    ("heartbeat", EventKind::Heartbeat),
    ("response_received", EventKind::ResponseReceived),
    ("update_room", EventKind::RoomUpdated),
    ("registered", EventKind::UserEntered),
    ("deregistered", EventKind::UserLeft),
    ("booted_user", EventKind::UserBooted),
    ("update_user", EventKind::UserUpdated),
    ("update_sticker_placements", EventKind::UserStickersUpdated),
    ("speak", EventKind::UserSpoke),
    ("add_dj", EventKind::DjAdded),
    ("rem_dj", EventKind::DjRemoved),
    ("new_moderator", EventKind::ModeratorAdded),
    ("rem_moderator", EventKind::ModeratorRemoved),
    ("nosong", EventKind::SongUnavailable),
    ("newsong", EventKind::SongStarted),
    ("song_ended", EventKind::SongEnded),
    ("update_votes", EventKind::SongVoted),
    ("snagged", EventKind::SongSnagged),
    ("song_blocked", EventKind::SongBlocked),
    ("dmca_error", EventKind::SongLimited),
    ("pmmed", EventKind::MessageReceived),
    ("search_complete", EventKind::SearchCompleted),
    ("search_failed", EventKind::SearchFailed),
];

impl EventKind {
    /// The canonical name used by handler registration.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::SessionMissing => "session_missing",
            Self::SessionEndRequested => "session_end_requested",
            Self::SessionEnded => "session_ended",
            Self::Reconnected => "reconnected",
            Self::Heartbeat => "heartbeat",
            Self::ResponseReceived => "response_received",
            Self::RoomUpdated => "room_updated",
            Self::UserEntered => "user_entered",
            Self::UserLeft => "user_left",
            Self::UserBooted => "user_booted",
            Self::UserUpdated => "user_updated",
            Self::UserNameUpdated => "user_name_updated",
            Self::UserAvatarUpdated => "user_avatar_updated",
            Self::UserStickersUpdated => "user_stickers_updated",
            Self::UserSpoke => "user_spoke",
            Self::FanAdded => "fan_added",
            Self::FanRemoved => "fan_removed",
            Self::DjAdded => "dj_added",
            Self::DjRemoved => "dj_removed",
            Self::DjEscortedOff => "dj_escorted_off",
            Self::DjBooedOff => "dj_booed_off",
            Self::ModeratorAdded => "moderator_added",
            Self::ModeratorRemoved => "moderator_removed",
            Self::SongUnavailable => "song_unavailable",
            Self::SongStarted => "song_started",
            Self::SongEnded => "song_ended",
            Self::SongVoted => "song_voted",
            Self::SongSnagged => "song_snagged",
            Self::SongBlocked => "song_blocked",
            Self::SongLimited => "song_limited",
            Self::MessageReceived => "message_received",
            Self::SearchCompleted => "search_completed",
            Self::SearchFailed => "search_failed",
        }
    }

    /// Look up an event by its canonical name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        ALL.iter().copied().find(|kind| kind.name() == name)
    }

    /// Classify a raw wire command.
    #[must_use]
    pub fn from_command(command: &str) -> Option<Self> {
        COMMANDS
            .iter()
            .find(|(cmd, _)| *cmd == command)
            .map(|(_, kind)| *kind)
    }
}

static ALL: &[EventKind] = &[
    EventKind::SessionMissing,
    EventKind::SessionEndRequested,
    EventKind::SessionEnded,
    EventKind::Reconnected,
    EventKind::Heartbeat,
    EventKind::ResponseReceived,
    EventKind::RoomUpdated,
    EventKind::UserEntered,
    EventKind::UserLeft,
    EventKind::UserBooted,
    EventKind::UserUpdated,
    EventKind::UserNameUpdated,
    EventKind::UserAvatarUpdated,
    EventKind::UserStickersUpdated,
    EventKind::UserSpoke,
    EventKind::FanAdded,
    EventKind::FanRemoved,
    EventKind::DjAdded,
    EventKind::DjRemoved,
    EventKind::DjEscortedOff,
    EventKind::DjBooedOff,
    EventKind::ModeratorAdded,
    EventKind::ModeratorRemoved,
    EventKind::SongUnavailable,
    EventKind::SongStarted,
    EventKind::SongEnded,
    EventKind::SongVoted,
    EventKind::SongSnagged,
    EventKind::SongBlocked,
    EventKind::SongLimited,
    EventKind::MessageReceived,
    EventKind::SearchCompleted,
    EventKind::SearchFailed,
];

/// Typed payload delivered to a handler invocation.
#[derive(Debug, Clone)]
pub enum Payload {
    /// The event carries no payload.
    None,
    /// The raw response data (for `response_received`).
    Data(Value),
    /// A single user.
    User(Entity),
    /// A user acted on by another user (fan gained, DJ escorted off).
    UserPair {
        /// The user the event is about.
        user: Entity,
        /// The acting user (new fan, escorting moderator).
        other: Entity,
    },
    /// A user lost this many fans.
    FanCount {
        /// The user the event is about.
        user: Entity,
        /// Number of fans lost.
        count: i64,
    },
    /// A boot with its actors and reason.
    Boot {
        /// The booted user.
        user: Entity,
        /// The booting moderator, when reported.
        moderator: Option<Entity>,
        /// The reported reason.
        reason: String,
    },
    /// A chat or private message.
    Chat {
        /// The sending user.
        sender: Entity,
        /// The message text.
        text: String,
    },
    /// A song was snagged onto a user's playlist.
    Snag {
        /// The snagging user.
        user: Entity,
        /// The song, when one is tracked.
        song: Option<Entity>,
    },
    /// A single song.
    Song(Entity),
    /// A list of songs (search results).
    Songs(Vec<Entity>),
    /// The current room.
    Room(Entity),
    /// Free text (e.g. the disconnect reason).
    Text(String),
}

/// One event occurrence ready for dispatch: the canonical kind, the raw
/// message data (predicates match against this), and the payload tuples
/// (handlers are invoked once per payload).
#[derive(Debug, Clone)]
pub struct Firing {
    /// Canonical event.
    pub kind: EventKind,
    /// Raw top-level message data.
    pub data: Value,
    /// One handler invocation per payload, in order.
    pub payloads: Vec<Payload>,
}

impl Firing {
    fn new(kind: EventKind, data: &Value, payloads: Vec<Payload>) -> Self {
        Self {
            kind,
            data: data.clone(),
            payloads,
        }
    }
}

/// Transform an inbound message into its ordered event firings, applying
/// the transform's scope side effects. Unknown commands produce nothing.
pub fn transform(scopes: &mut Scopes, msg: &Inbound) -> Vec<Firing> {
    let Some(kind) = EventKind::from_command(&msg.command) else {
        log::trace!("Ignoring unknown wire command {:?}", msg.command);
        return Vec::new();
    };
    let data = &msg.data;

    match kind {
        EventKind::SessionMissing
        | EventKind::SessionEnded
        | EventKind::Reconnected
        | EventKind::Heartbeat
        | EventKind::SearchFailed => vec![Firing::new(kind, data, vec![Payload::None])],

        EventKind::SessionEndRequested => {
            let reason = data
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("Unknown reason");
            vec![Firing::new(kind, data, vec![Payload::Text(reason.to_string())])]
        }

        EventKind::ResponseReceived => {
            vec![Firing::new(kind, data, vec![Payload::Data(data.clone())])]
        }

        EventKind::RoomUpdated => match scopes.room_mut() {
            Some(room) => {
                room.room.apply(data);
                let entity = room.room.clone();
                vec![Firing::new(kind, data, vec![Payload::Room(entity)])]
            }
            None => Vec::new(),
        },

        EventKind::UserEntered | EventKind::UserLeft => {
            let attrs_list = data.get("user").and_then(Value::as_array).cloned();
            let mut payloads = Vec::new();
            for attrs in attrs_list.unwrap_or_default() {
                let Some(user) = scopes.build_user(&attrs) else {
                    continue;
                };
                let id = user.id().to_string();
                if let Some(room) = scopes.room_mut() {
                    if kind == EventKind::UserEntered {
                        room.add_listener(&id);
                    } else {
                        room.remove_listener(&id);
                    }
                }
                payloads.push(Payload::User(user));
            }
            vec![Firing::new(kind, data, payloads)]
        }

        EventKind::UserBooted => transform_boot(scopes, data),
        EventKind::UserUpdated => transform_user_update(scopes, data),

        EventKind::UserStickersUpdated => match scopes.build_user(data) {
            Some(user) => vec![Firing::new(kind, data, vec![Payload::User(user)])],
            None => Vec::new(),
        },

        EventKind::UserSpoke | EventKind::MessageReceived => {
            let sender_key = if kind == EventKind::UserSpoke {
                "userid"
            } else {
                "senderid"
            };
            let Some(sender_id) = data.get(sender_key).and_then(Value::as_str) else {
                return Vec::new();
            };
            let sender = scopes.resolve_user(sender_id);
            let text = data
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            vec![Firing::new(kind, data, vec![Payload::Chat { sender, text }])]
        }

        EventKind::DjAdded => {
            let Some(user) = dj_from_message(scopes, data) else {
                return Vec::new();
            };
            if let Some(placements) = data.get("placements") {
                user.apply(&json!({ "placements": placements }));
            }
            let id = user.id().to_string();
            if let Some(room) = scopes.room_mut() {
                room.add_dj(&id);
            }
            vec![Firing::new(kind, data, vec![Payload::User(user)])]
        }

        EventKind::DjRemoved => transform_dj_removed(scopes, data),

        EventKind::ModeratorAdded | EventKind::ModeratorRemoved => {
            let Some(user) = scopes.build_user(data) else {
                return Vec::new();
            };
            let id = user.id().to_string();
            if let Some(room) = scopes.room_mut() {
                if kind == EventKind::ModeratorAdded {
                    room.add_moderator(&id);
                } else {
                    room.remove_moderator(&id);
                }
            }
            vec![Firing::new(kind, data, vec![Payload::User(user)])]
        }

        EventKind::SongUnavailable | EventKind::SongStarted => {
            transform_song_change(scopes, kind, data)
        }

        EventKind::SongEnded => {
            let song = scopes.room().and_then(RoomScope::current_song);
            let payloads = song.map(Payload::Song).into_iter().collect();
            vec![Firing::new(kind, data, payloads)]
        }

        EventKind::SongVoted => transform_votes(scopes, data),

        EventKind::SongSnagged => {
            let Some(user_id) = data.get("userid").and_then(Value::as_str) else {
                return Vec::new();
            };
            let user = scopes.resolve_user(user_id);
            let song = scopes.room().and_then(RoomScope::current_song);
            vec![Firing::new(kind, data, vec![Payload::Snag { user, song }])]
        }

        EventKind::SongBlocked | EventKind::SongLimited => {
            let mut firings = synthesize_song_ended(scopes, data);
            let song = transient_song(data);
            firings.push(Firing::new(kind, data, vec![Payload::Song(song)]));
            firings
        }

        EventKind::SearchCompleted => {
            let songs: Vec<Entity> = data
                .get("docs")
                .and_then(Value::as_array)
                .map(|docs| docs.iter().map(transient_song).collect())
                .unwrap_or_default();
            vec![Firing::new(kind, data, vec![Payload::Songs(songs)])]
        }

        // Detail events have no wire command; they only appear synthesized.
        EventKind::UserNameUpdated
        | EventKind::UserAvatarUpdated
        | EventKind::FanAdded
        | EventKind::FanRemoved
        | EventKind::DjEscortedOff
        | EventKind::DjBooedOff => Vec::new(),
    }
}

fn transform_boot(scopes: &mut Scopes, data: &Value) -> Vec<Firing> {
    let Some(user_id) = data.get("userid").and_then(Value::as_str) else {
        return Vec::new();
    };
    let user = scopes.resolve_user(user_id);
    let moderator = data
        .get("modid")
        .and_then(Value::as_str)
        .map(|id| scopes.resolve_user(id));
    let reason = data
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // Being booted means we are no longer in the room.
    if user.same_instance(&scopes.me()) {
        scopes.set_room(None);
    }

    vec![Firing::new(
        EventKind::UserBooted,
        data,
        vec![Payload::Boot {
            user,
            moderator,
            reason,
        }],
    )]
}

fn transform_user_update(scopes: &mut Scopes, data: &Value) -> Vec<Firing> {
    let fans_delta = data.get("fans").and_then(Value::as_i64).unwrap_or(0);
    let mut attrs = data.clone();
    if let Some(obj) = attrs.as_object_mut() {
        obj.remove("fans");
    }
    let Some(user) = scopes.build_user(&attrs) else {
        return Vec::new();
    };

    if fans_delta != 0 {
        let current = user
            .get("fans_count")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        user.apply(&json!({ "fans": current + fans_delta }));
    }

    let mut firings = vec![Firing::new(
        EventKind::UserUpdated,
        data,
        vec![Payload::User(user.clone())],
    )];

    // Detail events for exactly what changed.
    if data.get("name").is_some() {
        firings.push(Firing::new(
            EventKind::UserNameUpdated,
            data,
            vec![Payload::User(user.clone())],
        ));
    }
    if data.get("avatarid").is_some() {
        firings.push(Firing::new(
            EventKind::UserAvatarUpdated,
            data,
            vec![Payload::User(user.clone())],
        ));
    }
    if fans_delta > 0 {
        if let Some(fan_id) = data.get("fanid").and_then(Value::as_str) {
            let fan = scopes.resolve_user(fan_id);
            firings.push(Firing::new(
                EventKind::FanAdded,
                data,
                vec![Payload::UserPair { user, other: fan }],
            ));
        }
    } else if fans_delta < 0 {
        firings.push(Firing::new(
            EventKind::FanRemoved,
            data,
            vec![Payload::FanCount {
                user,
                count: fans_delta.abs(),
            }],
        ));
    }

    firings
}

fn dj_from_message(scopes: &mut Scopes, data: &Value) -> Option<Entity> {
    let attrs = data.get("user").and_then(Value::as_array)?.first()?;
    scopes.build_user(attrs)
}

fn transform_dj_removed(scopes: &mut Scopes, data: &Value) -> Vec<Firing> {
    let Some(user) = dj_from_message(scopes, data) else {
        return Vec::new();
    };
    let id = user.id().to_string();
    if let Some(room) = scopes.room_mut() {
        room.remove_dj(&id);
    }

    let mut firings = vec![Firing::new(
        EventKind::DjRemoved,
        data,
        vec![Payload::User(user.clone())],
    )];

    match data.get("modid") {
        // modid of 1 is the server's marker for a crowd boo-off.
        Some(modid) if modid.as_i64() == Some(1) => {
            firings.push(Firing::new(
                EventKind::DjBooedOff,
                data,
                vec![Payload::User(user)],
            ));
        }
        Some(modid) => {
            if let Some(mod_id) = modid.as_str() {
                let moderator = scopes.resolve_user(mod_id);
                firings.push(Firing::new(
                    EventKind::DjEscortedOff,
                    data,
                    vec![Payload::UserPair {
                        user,
                        other: moderator,
                    }],
                ));
            }
        }
        None => {}
    }

    firings
}

/// The end-before-start guarantee: when a tracked song gives way (next song
/// starts, none is available, or the song is blocked), synthesize its
/// `song_ended` ahead of the triggering event.
fn synthesize_song_ended(scopes: &Scopes, data: &Value) -> Vec<Firing> {
    match scopes.room().and_then(RoomScope::current_song) {
        Some(song) => vec![Firing::new(
            EventKind::SongEnded,
            data,
            vec![Payload::Song(song)],
        )],
        None => Vec::new(),
    }
}

fn transform_song_change(scopes: &mut Scopes, kind: EventKind, data: &Value) -> Vec<Firing> {
    let mut firings = synthesize_song_ended(scopes, data);

    let room_data = data.get("room").cloned().unwrap_or(Value::Null);
    let Some(room) = scopes.room_mut() else {
        return firings;
    };
    if room_data.is_object() {
        room.install_snapshot(&room_data, &[]);
    }

    if kind == EventKind::SongUnavailable {
        room.set_current_song(None);
        firings.push(Firing::new(kind, data, vec![Payload::None]));
    } else {
        match room.current_song() {
            Some(song) => firings.push(Firing::new(kind, data, vec![Payload::Song(song)])),
            None => firings.push(Firing::new(kind, data, Vec::new())),
        }
    }

    firings
}

fn transform_votes(scopes: &mut Scopes, data: &Value) -> Vec<Firing> {
    let Some(room) = scopes.room_mut() else {
        return Vec::new();
    };
    let Some(song) = room.current_song() else {
        return Vec::new();
    };

    let initial_up = song.get("up_votes_count").and_then(|v| v.as_i64()).unwrap_or(0);
    if let Some(room_data) = data.get("room") {
        song.apply(room_data);
    }
    let new_up = song.get("up_votes_count").and_then(|v| v.as_i64()).unwrap_or(0);

    // Up-votes credit the playing DJ with points.
    if let Some(dj) = room.current_dj() {
        let points = dj.get("points").and_then(|v| v.as_i64()).unwrap_or(0);
        dj.apply(&json!({ "points": points + (new_up - initial_up) }));
    }

    vec![Firing::new(
        EventKind::SongVoted,
        data,
        vec![Payload::Song(song)],
    )]
}

fn transient_song(attrs: &Value) -> Entity {
    let id = extract_id(EntityKind::Song, attrs).unwrap_or_default();
    let song = Entity::new(EntityKind::Song, id);
    song.apply(attrs);
    song
}
