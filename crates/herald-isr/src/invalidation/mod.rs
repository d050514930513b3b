//! Webhook-driven invalidation
//!
//! Maps a domain write event (`{type, action, data}`) to the routes it
//! affects and pushes a high-priority revalidation for each of them. The
//! event → route mapping is data ([`RouteTable`]), loaded from TOML.

use crate::engine::IsrEngine;
use crate::error::{IsrError, Result};
use crate::queue::{AddOutcome, Priority};
use crate::route::normalize_route;
use anyhow::Context;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

const BUILTIN_ROUTES: &str = include_str!("routes.toml");

/// Data key that scopes an event to a community
const COMMUNITY_KEY: &str = "community_id";

/// Inbound webhook body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvalidationEvent {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub action: Option<String>,

    #[serde(default)]
    pub data: Value,
}

impl InvalidationEvent {
    pub fn new(kind: &str, action: &str, data: Value) -> Self {
        Self {
            kind: Some(kind.to_string()),
            action: Some(action.to_string()),
            data,
        }
    }

    /// Check required fields; returns `(type, action, data)`
    fn validate(&self) -> Result<(&str, &str, Map<String, Value>)> {
        let kind = required(self.kind.as_deref(), "type")?;
        let action = required(self.action.as_deref(), "action")?;

        let data = match &self.data {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => {
                return Err(IsrError::InvalidPayload(
                    "`data` must be an object".to_string(),
                ))
            }
        };

        Ok((kind, action, data))
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(IsrError::InvalidPayload(format!("missing `{}`", field))),
    }
}

/// `type:action` → route templates
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteTable {
    #[serde(default)]
    events: HashMap<String, Vec<String>>,
}

impl RouteTable {
    /// The table bundled with the crate
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml_str(BUILTIN_ROUTES).context("Failed to parse bundled route table")
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a route table file
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read route table: {:?}", path))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse route table: {:?}", path))
    }

    pub fn templates(&self, kind: &str, action: &str) -> Option<&[String]> {
        self.events
            .get(&format!("{}:{}", kind, action))
            .map(Vec::as_slice)
    }

    /// Number of registered event kinds
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Concrete routes affected by an event: bare routes first, then their
    /// community-scoped copies, without duplicates.
    ///
    /// Unknown `type:action` pairs affect nothing.
    pub fn affected_routes(&self, event: &InvalidationEvent) -> Result<Vec<String>> {
        let (kind, action, data) = event.validate()?;

        let Some(templates) = self.templates(kind, action) else {
            debug!(kind, action, "no routes registered for event");
            return Ok(Vec::new());
        };

        let bare: Vec<String> = templates
            .iter()
            .filter_map(|template| match fill_template(template, &data) {
                Some(route) => Some(route),
                None => {
                    warn!(kind, action, template = %template, "event data lacks a template parameter, skipping route");
                    None
                }
            })
            .collect();

        let community = lookup_param(&data, COMMUNITY_KEY);

        let scoped = community.iter().flat_map(|community| {
            bare.iter()
                .filter(|route| !is_admin_route(route))
                .map(move |route| community_route(community, route))
        });

        let mut seen = HashSet::new();
        let routes = bare
            .iter()
            .cloned()
            .chain(scoped)
            .filter(|route| seen.insert(route.clone()))
            .collect();

        Ok(routes)
    }
}

/// Substitute `:param` segments; `None` when a parameter is missing
fn fill_template(template: &str, data: &Map<String, Value>) -> Option<String> {
    let mut route = String::new();
    for segment in template.split('/').filter(|s| !s.is_empty()) {
        route.push('/');
        match segment.strip_prefix(':') {
            Some(name) => {
                let value = lookup_param(data, name)?;
                route.push_str(&urlencoding::encode(&value));
            }
            None => route.push_str(segment),
        }
    }
    Some(normalize_route(&route))
}

/// Look a parameter up by its literal, snake_case and camelCase names
fn lookup_param(data: &Map<String, Value>, name: &str) -> Option<String> {
    [name.to_string(), to_snake_case(name), to_camel_case(name)]
        .iter()
        .find_map(|key| data.get(key).and_then(param_value))
}

fn param_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn to_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn is_admin_route(route: &str) -> bool {
    crate::route::route_has_prefix(route, "/admin")
}

fn community_route(community: &str, route: &str) -> String {
    let community = urlencoding::encode(community);
    if route == "/" {
        format!("/{}", community)
    } else {
        format!("/{}{}", community, route)
    }
}

/// Queue outcome for one route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedRoute {
    pub route: String,
    pub outcome: AddOutcome,
}

/// Synchronous revalidation outcome for one route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevalidatedRoute {
    pub route: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Turns domain events into revalidations
#[derive(Clone)]
pub struct InvalidationHandler {
    table: std::sync::Arc<RouteTable>,
    engine: IsrEngine,
}

impl InvalidationHandler {
    pub fn new(table: RouteTable, engine: IsrEngine) -> Self {
        Self {
            table: std::sync::Arc::new(table),
            engine,
        }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn affected_routes(&self, event: &InvalidationEvent) -> Result<Vec<String>> {
        self.table.affected_routes(event)
    }

    /// Queue a high-priority revalidation for every affected route
    pub fn enqueue(&self, event: &InvalidationEvent) -> Result<Vec<QueuedRoute>> {
        let routes = self.affected_routes(event)?;

        let queued: Vec<QueuedRoute> = routes
            .into_iter()
            .map(|route| {
                let outcome = self.engine.enqueue(&route, Priority::High);
                QueuedRoute { route, outcome }
            })
            .collect();

        info!(
            kind = event.kind.as_deref().unwrap_or_default(),
            action = event.action.as_deref().unwrap_or_default(),
            routes = queued.len(),
            "invalidation queued"
        );
        Ok(queued)
    }

    /// Revalidate every affected route now and report each result.
    ///
    /// At most `max_workers` renders run at once.
    pub async fn revalidate_now(&self, event: &InvalidationEvent) -> Result<Vec<RevalidatedRoute>> {
        let routes = self.affected_routes(event)?;
        let concurrency = self.engine.queue().status().max_workers;

        let results: Vec<RevalidatedRoute> = stream::iter(routes)
            .map(|route| async move {
                match self.engine.revalidate(&route).await {
                    Ok(_) => RevalidatedRoute {
                        route,
                        success: true,
                        error: None,
                    },
                    Err(e) => RevalidatedRoute {
                        route,
                        success: false,
                        error: Some(e.to_string()),
                    },
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            kind = event.kind.as_deref().unwrap_or_default(),
            action = event.action.as_deref().unwrap_or_default(),
            routes = results.len(),
            failed,
            "invalidation revalidated"
        );
        Ok(results)
    }
}
