//! Query key definitions.
//!
//! A `QueryKey` is an ordered list of tokens (`["articles", "list", {"page": 2}]`).
//! Keys are normalised on construction so that equivalent requests collide:
//! object tokens lose `null` fields, their keys are sorted, and documented
//! defaults (`page: 1`) are dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Object fields whose value is the implicit default and therefore dropped.
const DEFAULT_FIELDS: &[(&str, i64)] = &[("page", 1)];

/// A single normalised key token.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyToken {
    Str(String),
    Int(i64),
    Bool(bool),
    /// Plain object with sorted keys and no `null` values.
    Object(BTreeMap<String, Value>),
}

impl KeyToken {
    /// Normalise a JSON value into a token; `null` yields no token.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::String(s) => Some(Self::Str(s)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => Some(Self::Str(n.to_string())),
            },
            Value::Array(items) => Some(Self::Str(Value::Array(items).to_string())),
            Value::Object(map) => Some(Self::Object(normalize_object(map))),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Str(s) => Value::String(s.clone()),
            Self::Int(i) => Value::from(*i),
            Self::Bool(b) => Value::Bool(*b),
            Self::Object(map) => Value::Object(map.clone().into_iter().collect::<Map<_, _>>()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

fn normalize_object(map: Map<String, Value>) -> BTreeMap<String, Value> {
    map.into_iter()
        .filter(|(_, value)| !value.is_null())
        .filter(|(field, value)| {
            !DEFAULT_FIELDS
                .iter()
                .any(|(name, default)| field == name && value.as_i64() == Some(*default))
        })
        .map(|(field, value)| (field, normalize_nested(value)))
        .collect()
}

fn normalize_nested(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, normalize_nested(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_nested).collect()),
        other => other,
    }
}

/// Normalised, hashable identifier for a cacheable request.
///
/// Equality and hashing use the canonical serialisation, so two keys built
/// from semantically identical tokens are the same key.
#[derive(Clone)]
pub struct QueryKey {
    tokens: Vec<KeyToken>,
    serialized: String,
}

impl QueryKey {
    /// Build a key from raw JSON tokens.
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        let tokens: Vec<KeyToken> = tokens
            .into_iter()
            .filter_map(|token| KeyToken::from_value(token.into()))
            .collect();
        let serialized = Value::Array(tokens.iter().map(KeyToken::to_value).collect()).to_string();
        Self { tokens, serialized }
    }

    pub fn tokens(&self) -> &[KeyToken] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Canonical serialisation; the store's map key.
    pub fn serialized(&self) -> &str {
        &self.serialized
    }

    /// Token-wise prefix test. `["articles","list"]` never matches
    /// `["articles","listing"]`.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.tokens.len() <= self.tokens.len()
            && prefix
                .tokens
                .iter()
                .zip(self.tokens.iter())
                .all(|(a, b)| a == b)
    }

    /// Entity class inferred from the leading token.
    pub fn class(&self) -> EntityClass {
        match self.tokens.first().and_then(KeyToken::as_str) {
            Some("articles") => match self.tokens.get(1).and_then(KeyToken::as_str) {
                Some("search") => EntityClass::Search,
                _ => EntityClass::Articles,
            },
            Some("comments") => EntityClass::Comments,
            Some("tags") => EntityClass::Tags,
            Some("users") => EntityClass::Users,
            Some("search") => EntityClass::Search,
            Some("applications") => EntityClass::Applications,
            _ => EntityClass::Other,
        }
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.serialized == other.serialized
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.serialized)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let values: Vec<Value> = self.tokens.iter().map(KeyToken::to_value).collect();
        values.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<Value>::deserialize(deserializer)?;
        Ok(Self::new(values))
    }
}

/// Build a `QueryKey` from JSON-literal tokens.
///
/// ```ignore
/// let key = query_key!["articles", "list", {"page": 2, "limit": 8}];
/// ```
#[macro_export]
macro_rules! query_key {
    ($($token:tt),* $(,)?) => {
        $crate::cache::QueryKey::new(vec![$(::serde_json::json!($token)),*])
    };
}

/// Logical entity class; selects default stale times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityClass {
    Articles,
    Comments,
    Tags,
    Users,
    Search,
    Applications,
    Other,
}

// ============================================================================
// Key families used by the blog
// ============================================================================

pub fn articles() -> QueryKey {
    QueryKey::new(["articles"])
}

pub fn article_lists() -> QueryKey {
    QueryKey::new(["articles", "list"])
}

pub fn article_list(params: Value) -> QueryKey {
    QueryKey::new([Value::from("articles"), Value::from("list"), params])
}

pub fn article_search() -> QueryKey {
    QueryKey::new(["articles", "search"])
}

pub fn article_popular() -> QueryKey {
    QueryKey::new(["articles", "popular"])
}

pub fn article_detail(id: i64) -> QueryKey {
    QueryKey::new([Value::from("articles"), Value::from("detail"), Value::from(id)])
}

pub fn article_slug(slug: &str) -> QueryKey {
    QueryKey::new(["articles", "slug", slug])
}

pub fn article_related(id: i64) -> QueryKey {
    QueryKey::new([Value::from("articles"), Value::from("related"), Value::from(id)])
}

pub fn user_articles(user_id: i64) -> QueryKey {
    QueryKey::new([Value::from("articles"), Value::from("user"), Value::from(user_id)])
}

pub fn articles_by_tag(tag: &str) -> QueryKey {
    QueryKey::new(["articles", "tag", tag])
}

/// Root of every per-tag article list.
pub fn tagged_articles() -> QueryKey {
    QueryKey::new(["articles", "tag"])
}

pub fn articles_by_category(category: &str) -> QueryKey {
    QueryKey::new(["articles", "category", category])
}

pub fn article_comments(article_id: i64) -> QueryKey {
    QueryKey::new([
        Value::from("comments"),
        Value::from("article"),
        Value::from(article_id),
    ])
}

pub fn user_comments(user_id: i64) -> QueryKey {
    QueryKey::new([Value::from("comments"), Value::from("user"), Value::from(user_id)])
}

pub fn tags() -> QueryKey {
    QueryKey::new(["tags"])
}

pub fn popular_tags() -> QueryKey {
    QueryKey::new(["tags", "popular"])
}

pub fn users() -> QueryKey {
    QueryKey::new(["users"])
}

pub fn user_profile(user_id: i64) -> QueryKey {
    QueryKey::new([Value::from("users"), Value::from("profile"), Value::from(user_id)])
}

pub fn current_user() -> QueryKey {
    QueryKey::new(["users", "me"])
}

pub fn search() -> QueryKey {
    QueryKey::new(["search"])
}

pub fn applications() -> QueryKey {
    QueryKey::new(["applications"])
}

/// Every list-shaped article cache; status changes affect membership in all of them.
pub fn all_article_lists() -> Vec<QueryKey> {
    ["list", "user", "search", "popular", "tag", "category"]
        .into_iter()
        .map(|kind| QueryKey::new(["articles", kind]))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_page_is_dropped() {
        let a = query_key!["articles", "list", {"page": 1, "limit": 8}];
        let b = query_key!["articles", "list", {"limit": 8}];
        assert_eq!(a, b);
        assert_eq!(a.serialized(), b.serialized());

        let c = query_key!["articles", "list", {"page": 2, "limit": 8}];
        assert_ne!(a, c);
    }

    #[test]
    fn object_keys_are_sorted() {
        let a = query_key!["x", {"b": 1, "a": 2}];
        let b = query_key!["x", {"a": 2, "b": 1}];
        assert_eq!(a, b);
        assert_eq!(a.serialized(), r#"["x",{"a":2,"b":1}]"#);
    }

    #[test]
    fn nulls_are_stripped() {
        let a = QueryKey::new([json!("articles"), json!({"tag": null, "limit": 8}), Value::Null]);
        let b = query_key!["articles", {"limit": 8}];
        assert_eq!(a, b);
    }

    #[test]
    fn prefix_is_token_exact() {
        let prefix = query_key!["articles", "list"];
        assert!(query_key!["articles", "list", {"page": 2}].starts_with(&prefix));
        assert!(query_key!["articles", "list"].starts_with(&prefix));
        assert!(!query_key!["articles", "listing"].starts_with(&prefix));
        assert!(!query_key!["article", "list"].starts_with(&prefix));
        assert!(!query_key!["articles"].starts_with(&prefix));
    }

    #[test]
    fn class_follows_leading_token() {
        assert_eq!(article_detail(1).class(), EntityClass::Articles);
        assert_eq!(article_search().class(), EntityClass::Search);
        assert_eq!(article_comments(1).class(), EntityClass::Comments);
        assert_eq!(popular_tags().class(), EntityClass::Tags);
        assert_eq!(query_key!["forum"].class(), EntityClass::Other);
    }

    #[test]
    fn serde_roundtrip_keeps_normalisation() {
        let key = query_key!["articles", "list", {"page": 3}];
        let text = serde_json::to_string(&key).expect("serialize key");
        let back: QueryKey = serde_json::from_str(&text).expect("deserialize key");
        assert_eq!(key, back);
    }
}
