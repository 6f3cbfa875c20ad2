use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::debug;

use crate::db::Catalog;
use crate::models::{SmartCriteria, Video};

/// Change set produced by re-evaluating a smart folder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmartFolderDiff {
    pub matched: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Evaluates smart-folder criteria against the catalog and remembers the
/// last matching url set per criteria, keyed by its canonical string form.
pub struct SmartFolderEvaluator {
    catalog: Catalog,
    cache: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl SmartFolderEvaluator {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// All matching urls, sorted by date added when the criteria carry a
    /// date bound, by path otherwise. Updates the cache as a side effect.
    pub async fn find(&self, criteria: &SmartCriteria) -> Result<Vec<String>> {
        let mut matched = self.catalog.fetch_videos(criteria).await?;
        sort_matches(&mut matched, criteria);
        let urls: Vec<String> = matched.into_iter().map(|v| v.url).collect();

        let key = criteria.canonical_string();
        debug!("Smart criteria [{}] matched {} videos", key, urls.len());
        self.cache
            .lock()
            .await
            .insert(key, urls.iter().cloned().collect());
        Ok(urls)
    }

    /// Re-evaluates the criteria and diffs against the previous cached set.
    pub async fn update(&self, criteria: &SmartCriteria) -> Result<SmartFolderDiff> {
        let key = criteria.canonical_string();
        let previous = self
            .cache
            .lock()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_default();

        let matched = self.find(criteria).await?;
        let current: BTreeSet<String> = matched.iter().cloned().collect();

        let added = current.difference(&previous).cloned().collect();
        let removed = previous.difference(&current).cloned().collect();
        Ok(SmartFolderDiff {
            matched,
            added,
            removed,
        })
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}

fn sort_matches(videos: &mut [Video], criteria: &SmartCriteria) {
    if criteria.has_date_range() {
        videos.sort_by(|a, b| a.date_added.cmp(&b.date_added));
    } else {
        videos.sort_by(|a, b| a.url.cmp(&b.url));
    }
}
