//! Catalog index access
//!
//! The catalog enumerates every testable entry. It is served by the
//! component catalog as `index.json`:
//!
//! ```json
//! { "v": 5, "entries": { "button--primary": { "id": "button--primary", ... } } }
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use storyrun_common::config::CatalogConfig;
use storyrun_common::{CatalogEntry, Error, Result};
use tracing::debug;

/// Source of catalog entries
#[async_trait]
pub trait Catalog: Send + Sync {
    /// All entries currently known to the catalog
    async fn entries(&self) -> Result<Vec<CatalogEntry>>;
}

#[derive(Debug, Deserialize)]
struct IndexDocument {
    #[serde(default)]
    v: Option<u32>,
    entries: BTreeMap<String, CatalogEntry>,
}

/// Catalog served over HTTP
pub struct HttpCatalog {
    client: reqwest::Client,
    index_url: String,
}

impl HttpCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            index_url: config.index_url.clone(),
        })
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn entries(&self) -> Result<Vec<CatalogEntry>> {
        let response = self.client.get(&self.index_url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Catalog(format!(
                "{} returned {}",
                self.index_url,
                response.status()
            )));
        }
        let index: IndexDocument = response.json().await?;
        debug!(
            "Fetched {} catalog entries (index v{})",
            index.entries.len(),
            index.v.unwrap_or_default()
        );
        Ok(index.entries.into_values().collect())
    }
}

/// Fixed set of entries
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// Parse an `index.json` document
    pub fn from_index_json(json: &str) -> Result<Self> {
        let index: IndexDocument = serde_json::from_str(json)?;
        Ok(Self::new(index.entries.into_values().collect()))
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn entries(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.entries.clone())
    }
}
