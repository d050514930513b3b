//! Render client contract and the render-then-store revalidator

use crate::cache::{Artifact, CacheEntry, PageMeta};
use crate::config::TtlPolicy;
use crate::error::{IsrError, RenderError};
use crate::route_lock::{RouteGuard, RouteLocks};
use crate::storage::CacheStore;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Header sent to the upstream renderer so it can tell ISR fetches apart
pub const RENDER_HEADER: &str = "x-herald-render";

/// Produces the rendered artifact for a route.
///
/// Implementations are treated as slow and fallible; they never retry.
#[async_trait]
pub trait RenderClient: Send + Sync {
    async fn render_route(&self, route: &str) -> Result<Artifact, RenderError>;
}

/// Renders routes by fetching them from the upstream application
pub struct HttpRenderClient {
    client: reqwest::Client,
    origin: String,
}

impl HttpRenderClient {
    pub fn new(origin: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("herald-isr/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            origin: origin.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, route: &str) -> String {
        format!("{}{}", self.origin, route)
    }
}

#[async_trait]
impl RenderClient for HttpRenderClient {
    async fn render_route(&self, route: &str) -> Result<Artifact, RenderError> {
        let url = self.url_for(route);
        debug!(route, url = %url, "fetching route from upstream");

        let response = self
            .client
            .get(&url)
            .header(RENDER_HEADER, "1")
            .send()
            .await
            .map_err(|e| RenderError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RenderError::Upstream {
                status: status.as_u16(),
            });
        }

        let html = response
            .text()
            .await
            .map_err(|e| RenderError::Request(e.to_string()))?;

        let meta = extract_meta(&html);
        Ok(Artifact { html, meta })
    }
}

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title regex"));

static DESCRIPTION_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<meta\s[^>]*name\s*=\s*["']description["'][^>]*>"#)
        .expect("valid meta regex")
});

static CONTENT_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)content\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid content regex")
});

/// Pull `<title>` and `<meta name="description">` out of rendered HTML
pub fn extract_meta(html: &str) -> PageMeta {
    let title = TITLE_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty());

    let description = DESCRIPTION_TAG_RE
        .find(html)
        .and_then(|tag| CONTENT_ATTR_RE.captures(tag.as_str()))
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .filter(|d| !d.is_empty());

    PageMeta {
        title,
        description,
        ..Default::default()
    }
}

/// Renders a route and writes the result to the cache.
///
/// Shared by the queue workers, the cold-cache path and on-demand revalidation.
/// All of them write a route only while holding its [`RouteGuard`].
pub struct Revalidator {
    renderer: Arc<dyn RenderClient>,
    store: Arc<dyn CacheStore>,
    ttl: TtlPolicy,
    render_timeout: Option<Duration>,
    locks: RouteLocks,
}

impl Revalidator {
    pub fn new(
        renderer: Arc<dyn RenderClient>,
        store: Arc<dyn CacheStore>,
        ttl: TtlPolicy,
        render_timeout: Option<Duration>,
    ) -> Self {
        Self {
            renderer,
            store,
            ttl,
            render_timeout,
            locks: RouteLocks::new(),
        }
    }

    /// Become the only writer of `route` until the guard drops
    pub async fn lock_route(&self, route: &str) -> RouteGuard {
        self.locks.lock(route).await
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn ttl_for(&self, route: &str) -> u64 {
        self.ttl.ttl_for(route)
    }

    /// Run the render client in its own task so a panic surfaces as an error,
    /// bounded by the configured timeout.
    pub async fn render(&self, route: &str) -> Result<Artifact, RenderError> {
        let renderer = Arc::clone(&self.renderer);
        let owned_route = route.to_string();
        let mut task = tokio::spawn(async move { renderer.render_route(&owned_route).await });

        let joined = match self.render_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(RenderError::Timeout(limit));
                }
            },
            None => task.await,
        };

        joined.map_err(|e| RenderError::Crashed(e.to_string()))?
    }

    /// Render `route` and replace its cache entry.
    ///
    /// Waits for any other writer of the route to finish first, so the entry
    /// written last is always rendered last. A failed render or write leaves
    /// the existing entry untouched.
    pub async fn revalidate(&self, route: &str) -> Result<CacheEntry, IsrError> {
        let _guard = self.lock_route(route).await;

        let artifact = self.render(route).await.map_err(|source| IsrError::Render {
            route: route.to_string(),
            source,
        })?;

        self.store
            .set(route, artifact, self.ttl_for(route))
            .await
            .map_err(|source| IsrError::CacheWrite {
                route: route.to_string(),
                source,
            })
    }
}
