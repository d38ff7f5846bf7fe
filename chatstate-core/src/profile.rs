//! Cross-thread key/value profiles.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::page::Window;
use crate::{Namespace, ProfileValue, StoreError, ValueFilter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileItem {
    pub namespace: Namespace,
    pub key: String,
    pub value: ProfileValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub filter: Option<ValueFilter>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: ValueFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn window(&self) -> Window {
        Window {
            offset: self.offset,
            limit: self.limit,
        }
    }

    pub fn accepts(&self, item: &ProfileItem) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter.matches(&item.value))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceQuery {
    pub prefix: Option<Namespace>,
    pub suffix: Option<Namespace>,
    /// Namespaces deeper than this are truncated, merging their descendants.
    pub max_depth: Option<usize>,
    pub offset: usize,
    pub limit: Option<usize>,
}

pub type ProfileStream<'a> = BoxStream<'a, Result<ProfileItem, StoreError>>;

#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, namespace: &Namespace, key: &str)
        -> Result<Option<ProfileItem>, StoreError>;

    /// Replaces the whole value. `created_at` survives replacement.
    async fn put(
        &self,
        namespace: &Namespace,
        key: &str,
        value: ProfileValue,
    ) -> Result<ProfileItem, StoreError>;

    /// Deleting an absent profile succeeds.
    async fn delete(&self, namespace: &Namespace, key: &str) -> Result<(), StoreError>;

    /// Items whose namespace starts with `prefix`, in document id order.
    fn search<'a>(&'a self, prefix: &'a Namespace, query: SearchQuery) -> ProfileStream<'a>;

    async fn list_namespaces(&self, query: NamespaceQuery) -> Result<Vec<Namespace>, StoreError> {
        let root = Namespace::root();
        let prefix = query.prefix.as_ref().unwrap_or(&root);
        let mut items = self.search(prefix, SearchQuery::new());

        let mut seen = BTreeSet::new();
        while let Some(item) = items.try_next().await? {
            if let Some(suffix) = &query.suffix {
                if !item.namespace.ends_with(suffix) {
                    continue;
                }
            }
            let namespace = match query.max_depth {
                Some(depth) => item.namespace.truncated(depth),
                None => item.namespace,
            };
            seen.insert(namespace);
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(seen.into_iter().skip(query.offset).take(limit).collect())
    }
}

pub fn validate_address(namespace: &Namespace, key: &str) -> Result<(), StoreError> {
    namespace.validate()?;
    crate::namespace::validate_key(key)
}
