//! REST fetcher: resolves query keys against the blog API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde_json::Value;
use tracing::debug;

use crate::cache::{FetchError, Fetcher, KeyToken, QueryKey};
use crate::config::ApiSettings;

use super::error::InfraError;

/// Relative endpoint a key resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
}

impl Endpoint {
    fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            segments: segments.into_iter().map(|s| s.to_string()).collect(),
            query: Vec::new(),
        }
    }

    fn with_params(mut self, params: Option<&BTreeMap<String, Value>>) -> Self {
        if let Some(params) = params {
            self.query
                .extend(params.iter().map(|(name, value)| (name.clone(), param_value(value))));
        }
        self
    }

    fn with_pair(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(param_value)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Map a query key to its REST endpoint. Keys outside the blog's key families
/// have no endpoint.
pub fn endpoint_for(key: &QueryKey) -> Option<Endpoint> {
    use KeyToken::{Int, Object, Str};

    let tokens = key.tokens();
    let params = tokens.iter().find_map(|token| match token {
        Object(map) => Some(map),
        _ => None,
    });
    let path: Vec<&KeyToken> = tokens
        .iter()
        .filter(|token| !matches!(token, Object(_)))
        .collect();

    let endpoint = match path.as_slice() {
        [Str(a)] if a == "articles" => Endpoint::new(["articles"]),
        [Str(a), Str(b)] if a == "articles" && b == "list" => Endpoint::new(["articles"]),
        [Str(a), Str(b)] if a == "articles" && b == "search" => {
            Endpoint::new(["articles", "search"])
        }
        [Str(a), Str(b)] if a == "articles" && b == "popular" => {
            Endpoint::new(["articles", "popular"])
        }
        [Str(a), Str(b), Int(id)] if a == "articles" && b == "detail" => {
            Endpoint::new(["articles".to_string(), id.to_string()])
        }
        [Str(a), Str(b), Str(slug)] if a == "articles" && b == "slug" => {
            Endpoint::new(["articles", "slug", slug.as_str()])
        }
        [Str(a), Str(b), Int(id)] if a == "articles" && b == "related" => {
            Endpoint::new(["articles".to_string(), id.to_string(), "related".to_string()])
        }
        [Str(a), Str(b), Int(user)] if a == "articles" && b == "user" => {
            Endpoint::new(["users".to_string(), user.to_string(), "articles".to_string()])
        }
        [Str(a), Str(b), Str(tag)] if a == "articles" && b == "tag" => {
            Endpoint::new(["articles"]).with_pair("tag", tag)
        }
        [Str(a), Str(b), Str(category)] if a == "articles" && b == "category" => {
            Endpoint::new(["articles"]).with_pair("category", category)
        }
        [Str(a), Str(b), Int(id)] if a == "comments" && b == "article" => {
            Endpoint::new(["articles".to_string(), id.to_string(), "comments".to_string()])
        }
        [Str(a), Str(b), Int(user)] if a == "comments" && b == "user" => {
            Endpoint::new(["users".to_string(), user.to_string(), "comments".to_string()])
        }
        [Str(a)] if a == "tags" => Endpoint::new(["tags"]),
        [Str(a), Str(b)] if a == "tags" && b == "popular" => Endpoint::new(["tags", "popular"]),
        [Str(a), Str(b)] if a == "users" && b == "me" => Endpoint::new(["auth", "me"]),
        [Str(a), Str(b), Int(user)] if a == "users" && b == "profile" => {
            Endpoint::new(["users".to_string(), user.to_string()])
        }
        [Str(a)] if a == "search" => Endpoint::new(["search"]),
        [Str(a)] if a == "applications" => Endpoint::new(["applications"]),
        _ => return None,
    };

    Some(endpoint.with_params(params))
}

/// `Fetcher` backed by the blog's REST API.
#[derive(Clone, Debug)]
pub struct RestFetcher {
    client: Client,
    base: Url,
}

impl RestFetcher {
    pub fn new(settings: &ApiSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.timeout)
            .build()
            .map_err(|err| InfraError::http(err.to_string()))?;
        Ok(Self {
            client,
            base: settings.base_url.clone(),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("beekeeper/", env!("CARGO_PKG_VERSION"))
    }

    pub fn url(&self, endpoint: &Endpoint) -> Result<Url, FetchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::network(format!("base URL `{}` cannot hold a path", self.base)))?
            .pop_if_empty()
            .extend(&endpoint.segments);
        if !endpoint.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &endpoint.query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    async fn handle(resp: Response) -> Result<Value, FetchError> {
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| FetchError::network(err.to_string()))?;
        decode_body(status.as_u16(), status.is_success(), &bytes)
    }
}

fn decode_body(status: u16, success: bool, bytes: &[u8]) -> Result<Value, FetchError> {
    if !success {
        let text = String::from_utf8_lossy(bytes).into_owned();
        return Err(FetchError::from_status(status, text));
    }
    let body: Value =
        serde_json::from_slice(bytes).map_err(|err| FetchError::decode(status, err.to_string()))?;
    Ok(unwrap_envelope(body))
}

/// The API wraps payloads as `{"success": true, "data": ...}`.
fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("success") && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[async_trait]
impl Fetcher for RestFetcher {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError> {
        let endpoint = endpoint_for(key)
            .ok_or_else(|| FetchError::from_status(400, format!("no endpoint for key {key}")))?;
        let url = self.url(&endpoint)?;
        debug!(key = %key, url = %url, "fetching from api");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::network(err.to_string()))?;
        Self::handle(resp).await
    }
}
