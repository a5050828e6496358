//! Canonical remote entities.
//!
//! An [`Entity`] is the single in-memory representation of a remote object
//! (user, room, song) identified by id. Handles are cheap `Arc` clones of
//! one shared instance; equality and hashing consider only `(kind, id)`, so
//! two handles to the same id are interchangeable even when one is observed
//! with stale attributes. All references must resolve through a scope's
//! cache (see [`scope`](crate::scope)); constructing a second instance for
//! an id that is already cached would silently diverge from the canonical
//! one.
//!
//! Attribute access goes through a fixed per-kind schema table of
//! `(field, wire aliases, loadable)`: partial updates are merged in place
//! with alias normalization, and reading an attribute that is not yet
//! present triggers a remote load unless the field is declared non-loadable
//! (push-only fields like vote counts must never cause an implicit fetch).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use crate::client::Client;
use crate::error::ClientError;

/// The kinds of remote entity the cache deduplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A service user (listener, DJ, moderator, or the authorized user).
    User,
    /// A DJ room.
    Room,
    /// A song.
    Song,
}

/// One row of a per-kind schema table.
#[derive(Debug)]
pub struct FieldSpec {
    /// Canonical field name exposed to callers.
    pub name: &'static str,
    /// Wire names this field arrives under.
    pub aliases: &'static [&'static str],
    /// Whether an absent value may be fetched remotely on first read.
    pub loadable: bool,
    /// Optional normalization applied to incoming values.
    pub transform: Option<fn(Value) -> Value>,
}

const fn field(name: &'static str, aliases: &'static [&'static str], loadable: bool) -> FieldSpec {
    FieldSpec {
        name,
        aliases,
        loadable,
        transform: None,
    }
}

/// The chat host arrives as a one-element array.
fn first_element(value: Value) -> Value {
    match value {
        Value::Array(mut items) if !items.is_empty() => items.remove(0),
        other => other,
    }
}

static USER_FIELDS: &[FieldSpec] = &[
    field("name", &["username"], true),
    field("laptop_name", &["laptop"], true),
    field("laptop_version", &[], true),
    field("points", &[], true),
    field("acl", &[], true),
    field("fans_count", &["fans"], true),
    field("facebook_url", &["facebook"], true),
    field("twitter_id", &["twitter", "twitterid", "twitterid_lower"], true),
    field("website", &[], true),
    field("about", &[], true),
    field("top_artists", &["topartists"], true),
    field("hangout", &[], true),
    field("avatar_id", &["avatarid"], true),
    field("email", &[], true),
    field("has_password", &["has_tt_password"], true),
    // Set by the authorized user or pushed by the server, never fetched.
    field("status", &[], false),
    field("sticker_placements", &["placements"], false),
];

static ROOM_FIELDS: &[FieldSpec] = &[
    field("name", &[], true),
    field("description", &[], true),
    field("shortcut", &[], true),
    field("privacy", &[], true),
    field("listener_capacity", &["max_size"], true),
    field("dj_capacity", &["max_djs"], true),
    field("dj_minimum_points", &["djthreshold"], true),
    field("genre", &[], true),
    field("created_at", &["created"], true),
    field("featured", &[], true),
    FieldSpec {
        name: "host",
        aliases: &["chatserver"],
        loadable: true,
        transform: Some(first_element),
    },
    // Populated only by directory lookups and push events.
    field("section", &[], false),
    field("friends", &[], false),
    field("songs_played", &["songlog"], false),
];

// Song metadata arrives with the push event that starts the song; there is
// no per-song fetch on this connection, so every field is push-only.
static SONG_FIELDS: &[FieldSpec] = &[
    field("title", &["song"], false),
    field("artist", &[], false),
    field("album", &[], false),
    field("genre", &[], false),
    field("label", &[], false),
    field("isrc", &[], false),
    field("cover_art_url", &["coverart"], false),
    field("length", &[], false),
    field("snaggable", &[], false),
    field("source", &[], false),
    field("source_id", &["sourceid"], false),
    field("started_at", &["starttime"], false),
    field("up_votes_count", &["upvotes"], false),
    field("down_votes_count", &["downvotes"], false),
    field("votes", &["votelog"], false),
    field("score", &[], false),
    field("played_by", &["djid"], false),
];

/// The schema table for a kind.
#[must_use]
pub fn schema(kind: EntityKind) -> &'static [FieldSpec] {
    match kind {
        EntityKind::User => USER_FIELDS,
        EntityKind::Room => ROOM_FIELDS,
        EntityKind::Song => SONG_FIELDS,
    }
}

/// Resolve a canonical or aliased field name against a kind's schema.
#[must_use]
pub fn lookup(kind: EntityKind, key: &str) -> Option<&'static FieldSpec> {
    schema(kind)
        .iter()
        .find(|spec| spec.name == key || spec.aliases.contains(&key))
}

/// Wire aliases under which an entity's id may arrive.
#[must_use]
pub fn id_aliases(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::User => &["_id", "userid"],
        EntityKind::Room => &["_id", "roomid"],
        EntityKind::Song => &["_id"],
    }
}

/// Extract an entity id from a partial attribute object.
#[must_use]
pub fn extract_id(kind: EntityKind, attrs: &Value) -> Option<String> {
    for alias in id_aliases(kind) {
        if let Some(id) = attrs.get(*alias).and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    None
}

#[derive(Debug)]
struct EntityInner {
    kind: EntityKind,
    id: String,
    attrs: Mutex<Map<String, Value>>,
    loaded: AtomicBool,
}

/// A shared handle to the canonical instance of a remote entity.
#[derive(Debug, Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    /// Create a fresh entity. Callers other than the scope caches should
    /// resolve through the cache instead.
    #[must_use]
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                kind,
                id: id.into(),
                attrs: Mutex::new(Map::new()),
                loaded: AtomicBool::new(false),
            }),
        }
    }

    /// The entity's unique id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The entity's kind.
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.inner.kind
    }

    /// Whether the two handles share one canonical instance.
    #[must_use]
    pub fn same_instance(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read an attribute by its canonical name, without triggering a load.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner
            .attrs
            .lock()
            .expect("attrs lock poisoned")
            .get(name)
            .cloned()
    }

    /// Merge a partial attribute update in place.
    ///
    /// Keys are normalized through the schema's wire aliases; a nested
    /// `metadata` object is flattened into the update; id aliases and
    /// unknown keys are skipped. Only the fields present in the update
    /// change. This is a merge, never a wholesale replace.
    pub fn apply(&self, update: &Value) {
        let Some(obj) = update.as_object() else {
            return;
        };
        let mut attrs = self.inner.attrs.lock().expect("attrs lock poisoned");
        Self::merge_into(&mut attrs, self.inner.kind, obj);
    }

    fn merge_into(attrs: &mut Map<String, Value>, kind: EntityKind, obj: &Map<String, Value>) {
        for (key, value) in obj {
            if key == "metadata" {
                if let Some(nested) = value.as_object() {
                    Self::merge_into(attrs, kind, nested);
                }
                continue;
            }
            if id_aliases(kind).contains(&key.as_str()) {
                continue;
            }
            match lookup(kind, key) {
                Some(spec) => {
                    let value = match spec.transform {
                        Some(f) => f(value.clone()),
                        None => value.clone(),
                    };
                    attrs.insert(spec.name.to_string(), value);
                }
                None => log::trace!("Ignoring unknown {kind:?} attribute {key:?}"),
            }
        }
    }

    /// Whether a full remote load has completed for this entity.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    fn mark_loaded(&self) {
        self.inner.loaded.store(true, Ordering::Release);
    }

    /// Read an attribute, lazily loading the entity on first access.
    ///
    /// Returns the cached value when present. Otherwise, when the field is
    /// loadable and the entity has not been loaded yet, issues the kind's
    /// load command and retries. Non-loadable fields never trigger a fetch
    /// and simply return `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`ClientError`] when the remote load fails.
    pub async fn fetch(&self, client: &Client, name: &str) -> Result<Option<Value>, ClientError> {
        // Accept wire aliases; attributes are stored under canonical names.
        let spec = lookup(self.inner.kind, name);
        let key = spec.map_or(name, |spec| spec.name);
        if let Some(value) = self.get(key) {
            return Ok(Some(value));
        }
        if !spec.is_some_and(|spec| spec.loadable) || self.is_loaded() {
            return Ok(None);
        }
        self.load(client).await?;
        Ok(self.get(key))
    }

    /// Force a full remote load of this entity's attributes.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`ClientError`] when the command fails.
    pub async fn load(&self, client: &Client) -> Result<(), ClientError> {
        let data = match self.inner.kind {
            EntityKind::User => {
                client
                    .call("user.get_profile", json!({ "userid": self.id() }))
                    .await?
            }
            EntityKind::Room => {
                let data = client
                    .call("room.info", json!({ "roomid": self.id() }))
                    .await?;
                data.get("room").cloned().unwrap_or(data)
            }
            // Songs carry their metadata on the push event that starts them.
            EntityKind::Song => return Ok(()),
        };
        self.apply(&data);
        self.mark_loaded();
        Ok(())
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.inner.kind == other.inner.kind && self.inner.id == other.inner.id
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.kind.hash(state);
        self.inner.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_normalizes_wire_aliases() {
        let user = Entity::new(EntityKind::User, "u1");
        user.apply(&json!({"username": "DJSpinster", "laptop": "mac"}));
        assert_eq!(user.get("name"), Some(json!("DJSpinster")));
        assert_eq!(user.get("laptop_name"), Some(json!("mac")));
    }

    #[test]
    fn test_apply_merges_without_clearing_existing_fields() {
        let user = Entity::new(EntityKind::User, "u1");
        user.apply(&json!({"name": "old", "points": 5}));
        user.apply(&json!({"name": "new"}));
        assert_eq!(user.get("name"), Some(json!("new")));
        assert_eq!(user.get("points"), Some(json!(5)));
    }

    #[test]
    fn test_apply_flattens_metadata() {
        let song = Entity::new(EntityKind::Song, "s1");
        song.apply(&json!({"metadata": {"song": "Title", "artist": "Band"}}));
        assert_eq!(song.get("title"), Some(json!("Title")));
        assert_eq!(song.get("artist"), Some(json!("Band")));
    }

    #[test]
    fn test_apply_skips_id_aliases_and_unknown_keys() {
        let user = Entity::new(EntityKind::User, "u1");
        user.apply(&json!({"_id": "other", "userid": "other", "wat": 1}));
        assert_eq!(user.id(), "u1");
        assert_eq!(user.get("wat"), None);
    }

    #[test]
    fn test_room_host_transform_takes_first_element() {
        let room = Entity::new(EntityKind::Room, "r1");
        room.apply(&json!({"chatserver": ["chat2.example.com", 80]}));
        assert_eq!(room.get("host"), Some(json!("chat2.example.com")));
    }

    #[test]
    fn test_equality_and_hash_by_id_alone() {
        use std::collections::HashSet;
        let a = Entity::new(EntityKind::User, "u1");
        let b = Entity::new(EntityKind::User, "u1");
        a.apply(&json!({"points": 100}));
        assert_eq!(a, b);
        assert!(!a.same_instance(&b));
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_update_through_one_handle_visible_through_clone() {
        let a = Entity::new(EntityKind::User, "u1");
        let b = a.clone();
        a.apply(&json!({"points": 7}));
        assert_eq!(b.get("points"), Some(json!(7)));
        assert!(a.same_instance(&b));
    }

    #[test]
    fn test_extract_id_prefers_any_alias() {
        assert_eq!(
            extract_id(EntityKind::User, &json!({"userid": "u9"})),
            Some("u9".to_string())
        );
        assert_eq!(
            extract_id(EntityKind::Room, &json!({"roomid": "r2"})),
            Some("r2".to_string())
        );
        assert_eq!(extract_id(EntityKind::User, &json!({})), None);
    }

    #[test]
    fn test_push_only_fields_are_not_loadable() {
        assert!(!lookup(EntityKind::Song, "upvotes").unwrap().loadable);
        assert!(!lookup(EntityKind::Room, "friends").unwrap().loadable);
        assert!(!lookup(EntityKind::User, "placements").unwrap().loadable);
        assert!(lookup(EntityKind::User, "name").unwrap().loadable);
    }
}
