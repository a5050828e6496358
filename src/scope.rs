//! Entity scopes and cross-scope promotion.
//!
//! The invariant of at most one live [`Entity`] per (scope, id)
//! is enforced here. Two scopes exist: the client scope (the authorized
//! user plus known acquaintances, alive for the client's lifetime) and the
//! room scope (everyone referenced while in a room, reclaimed on leave).
//!
//! Promotion: a user reference, however minimal, resolves to the existing
//! canonical instance when it matches the authorized user, the room
//! creator, a current listener/DJ/moderator, or a known acquaintance,
//! never to a fresh instance that would diverge from the canonical one.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::entity::{extract_id, Entity, EntityKind};

/// Per-room identity cache plus the room's role membership and song state.
#[derive(Debug)]
pub struct RoomScope {
    /// The room entity itself.
    pub room: Entity,
    users: HashMap<String, Entity>,
    listeners: HashSet<String>,
    djs: HashSet<String>,
    moderators: HashSet<String>,
    creator: Option<String>,
    current_song: Option<Entity>,
    current_dj: Option<String>,
}

impl RoomScope {
    /// Create an empty scope for the given room id.
    #[must_use]
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room: Entity::new(EntityKind::Room, room_id),
            users: HashMap::new(),
            listeners: HashSet::new(),
            djs: HashSet::new(),
            moderators: HashSet::new(),
            creator: None,
            current_song: None,
            current_dj: None,
        }
    }

    fn canonical(&mut self, id: &str) -> Entity {
        self.users
            .entry(id.to_string())
            .or_insert_with(|| Entity::new(EntityKind::User, id))
            .clone()
    }

    /// Current listener ids.
    #[must_use]
    pub fn listeners(&self) -> Vec<Entity> {
        self.role_entities(&self.listeners)
    }

    /// Current DJ ids.
    #[must_use]
    pub fn djs(&self) -> Vec<Entity> {
        self.role_entities(&self.djs)
    }

    /// Current moderator ids.
    #[must_use]
    pub fn moderators(&self) -> Vec<Entity> {
        self.role_entities(&self.moderators)
    }

    fn role_entities(&self, ids: &HashSet<String>) -> Vec<Entity> {
        ids.iter().filter_map(|id| self.users.get(id).cloned()).collect()
    }

    /// Whether the user currently holds the listener role.
    #[must_use]
    pub fn is_listener(&self, id: &str) -> bool {
        self.listeners.contains(id)
    }

    /// Whether the user is currently on the decks.
    #[must_use]
    pub fn is_dj(&self, id: &str) -> bool {
        self.djs.contains(id)
    }

    /// Whether the user currently moderates the room.
    #[must_use]
    pub fn is_moderator(&self, id: &str) -> bool {
        self.moderators.contains(id)
    }

    /// The room's creator, when known.
    #[must_use]
    pub fn creator(&self) -> Option<Entity> {
        self.creator.as_deref().and_then(|id| self.users.get(id).cloned())
    }

    /// The song currently playing, when any.
    #[must_use]
    pub fn current_song(&self) -> Option<Entity> {
        self.current_song.clone()
    }

    /// Replace the current song, returning the previous one.
    pub fn set_current_song(&mut self, song: Option<Entity>) -> Option<Entity> {
        std::mem::replace(&mut self.current_song, song)
    }

    /// The DJ whose song is currently playing.
    #[must_use]
    pub fn current_dj(&self) -> Option<Entity> {
        self.current_dj.as_deref().and_then(|id| self.users.get(id).cloned())
    }

    pub(crate) fn add_listener(&mut self, id: &str) {
        self.listeners.insert(id.to_string());
    }

    pub(crate) fn remove_listener(&mut self, id: &str) {
        self.listeners.remove(id);
    }

    pub(crate) fn add_dj(&mut self, id: &str) {
        self.djs.insert(id.to_string());
    }

    pub(crate) fn remove_dj(&mut self, id: &str) {
        self.djs.remove(id);
    }

    pub(crate) fn add_moderator(&mut self, id: &str) {
        self.moderators.insert(id.to_string());
    }

    pub(crate) fn remove_moderator(&mut self, id: &str) {
        self.moderators.remove(id);
    }

    /// Install the full state snapshot returned by `room.info`: room
    /// attributes, the listener list, role memberships, creator, and the
    /// current song, in one pass with listeners resolved first so role ids
    /// promote to the freshly-populated instances.
    pub fn install_snapshot(&mut self, room_data: &Value, users: &[Value]) {
        self.room.apply(room_data);

        for attrs in users {
            if let Some(id) = extract_id(EntityKind::User, attrs) {
                let user = self.canonical(&id);
                user.apply(attrs);
                self.listeners.insert(id);
            }
        }

        if let Some(creator_attrs) = room_data.get("creator") {
            if let Some(id) = extract_id(EntityKind::User, creator_attrs) {
                self.canonical(&id).apply(creator_attrs);
                self.creator = Some(id);
            }
        }

        let metadata = room_data.get("metadata").unwrap_or(room_data);

        if let Some(ids) = metadata.get("djs").and_then(Value::as_array) {
            self.djs = id_set(ids);
            for id in &self.djs.clone() {
                self.canonical(id);
            }
        }
        if let Some(ids) = metadata.get("moderator_id").and_then(Value::as_array) {
            self.moderators = id_set(ids);
            for id in &self.moderators.clone() {
                self.canonical(id);
            }
        }

        if let Some(song_attrs) = metadata.get("current_song") {
            if song_attrs.is_object() {
                let song = extract_id(EntityKind::Song, song_attrs)
                    .map(|id| Entity::new(EntityKind::Song, id))
                    .unwrap_or_else(|| Entity::new(EntityKind::Song, ""));
                song.apply(song_attrs);
                self.current_song = Some(song);
            } else {
                self.current_song = None;
            }
        }
        if let Some(dj_id) = metadata.get("current_dj").and_then(Value::as_str) {
            self.canonical(dj_id);
            self.current_dj = Some(dj_id.to_string());
        }
    }
}

fn id_set(ids: &[Value]) -> HashSet<String> {
    ids.iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

/// All entity scopes for one client.
#[derive(Debug)]
pub struct Scopes {
    me: Entity,
    acquaintances: HashMap<String, Entity>,
    room: Option<RoomScope>,
}

impl Scopes {
    /// Create the client scope around the authorized user's id.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            me: Entity::new(EntityKind::User, user_id),
            acquaintances: HashMap::new(),
            room: None,
        }
    }

    /// The authorized user's canonical entity (client-global).
    #[must_use]
    pub fn me(&self) -> Entity {
        self.me.clone()
    }

    /// The current room scope, when entered.
    #[must_use]
    pub fn room(&self) -> Option<&RoomScope> {
        self.room.as_ref()
    }

    /// Mutable access for the dispatch path's transforms.
    pub fn room_mut(&mut self) -> Option<&mut RoomScope> {
        self.room.as_mut()
    }

    /// Install a new room scope, discarding the previous one (and every
    /// entity it owned).
    pub fn set_room(&mut self, scope: Option<RoomScope>) {
        self.room = scope;
    }

    /// Record a client-global acquaintance (e.g. from the fan-of list).
    pub fn add_acquaintance(&mut self, id: &str) -> Entity {
        if id == self.me.id() {
            return self.me.clone();
        }
        self.acquaintances
            .entry(id.to_string())
            .or_insert_with(|| Entity::new(EntityKind::User, id))
            .clone()
    }

    /// Resolve a user id to its canonical entity.
    ///
    /// Promotion order: the authorized user, then a known acquaintance,
    /// then the room scope (creating the room-scoped instance on first
    /// reference). With no room entered, unknown ids get a transient
    /// instance; there is no scope to own them.
    pub fn resolve_user(&mut self, id: &str) -> Entity {
        if id == self.me.id() {
            return self.me.clone();
        }
        if let Some(user) = self.acquaintances.get(id) {
            return user.clone();
        }
        match self.room.as_mut() {
            Some(room) => room.canonical(id),
            None => Entity::new(EntityKind::User, id),
        }
    }

    /// Resolve a user from a partial attribute object and merge the
    /// attributes into the canonical instance.
    pub fn build_user(&mut self, attrs: &Value) -> Option<Entity> {
        let id = extract_id(EntityKind::User, attrs)?;
        let user = self.resolve_user(&id);
        user.apply(attrs);
        Some(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_twice_returns_same_instance() {
        let mut scopes = Scopes::new("me");
        scopes.set_room(Some(RoomScope::new("r1")));
        let a = scopes.resolve_user("u1");
        let b = scopes.resolve_user("u1");
        assert!(a.same_instance(&b));
    }

    #[test]
    fn test_partial_update_visible_through_other_handle() {
        let mut scopes = Scopes::new("me");
        scopes.set_room(Some(RoomScope::new("r1")));
        let a = scopes.resolve_user("u1");
        let b = scopes.resolve_user("u1");
        a.apply(&json!({"points": 12}));
        assert_eq!(b.get("points"), Some(json!(12)));
    }

    #[test]
    fn test_id_only_reference_promotes_to_authorized_user() {
        let mut scopes = Scopes::new("me");
        scopes.me().apply(&json!({"name": "Me"}));
        let resolved = scopes.build_user(&json!({"_id": "me"})).unwrap();
        assert!(resolved.same_instance(&scopes.me()));
        assert_eq!(resolved.get("name"), Some(json!("Me")));
    }

    #[test]
    fn test_id_only_reference_promotes_to_listener() {
        let mut scopes = Scopes::new("me");
        let mut room = RoomScope::new("r1");
        room.install_snapshot(
            &json!({"name": "Rock"}),
            &[json!({"_id": "u1", "name": "Listener One"})],
        );
        scopes.set_room(Some(room));

        let resolved = scopes.resolve_user("u1");
        assert_eq!(resolved.get("name"), Some(json!("Listener One")));
        let listener = scopes.room().unwrap().listeners().pop().unwrap();
        assert!(resolved.same_instance(&listener));
    }

    #[test]
    fn test_acquaintance_promotes_without_a_room() {
        let mut scopes = Scopes::new("me");
        let fan = scopes.add_acquaintance("u2");
        let resolved = scopes.resolve_user("u2");
        assert!(fan.same_instance(&resolved));
    }

    #[test]
    fn test_snapshot_installs_roles_creator_and_current_song() {
        let mut room = RoomScope::new("r1");
        room.install_snapshot(
            &json!({
                "name": "Indie",
                "creator": {"_id": "c1", "name": "Creator"},
                "metadata": {
                    "djs": ["u1"],
                    "moderator_id": ["c1"],
                    "current_dj": "u1",
                    "current_song": {"_id": "s1", "metadata": {"song": "Tune", "artist": "Band"}},
                    "upvotes": 3
                }
            }),
            &[json!({"_id": "u1", "name": "DJ One"}), json!({"_id": "u2"})],
        );

        assert!(room.is_listener("u1") && room.is_listener("u2"));
        assert!(room.is_dj("u1") && !room.is_dj("u2"));
        assert!(room.is_moderator("c1"));
        assert_eq!(room.creator().unwrap().id(), "c1");
        assert_eq!(room.room.get("name"), Some(json!("Indie")));

        let song = room.current_song().unwrap();
        assert_eq!(song.id(), "s1");
        assert_eq!(song.get("title"), Some(json!("Tune")));
        assert!(room.current_dj().unwrap().same_instance(&room.djs().pop().unwrap()));
    }

    #[test]
    fn test_leaving_room_reclaims_scope() {
        let mut scopes = Scopes::new("me");
        scopes.set_room(Some(RoomScope::new("r1")));
        scopes.resolve_user("u1").apply(&json!({"points": 1}));
        scopes.set_room(None);
        scopes.set_room(Some(RoomScope::new("r2")));
        // Fresh scope, fresh instance.
        assert_eq!(scopes.resolve_user("u1").get("points"), None);
    }
}
