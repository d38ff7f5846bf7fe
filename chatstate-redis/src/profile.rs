use chrono::Utc;

use chatstate_core::page::{paginate, Page};
use chatstate_core::profile::validate_address;
use chatstate_core::{
    encode_json, format_timestamp, parse_timestamp, Namespace, ProfileItem, ProfileStore,
    ProfileStream, ProfileValue, SearchQuery, StoreError,
};

use crate::script::{DELETE_PROFILE, PROFILE_PAGE, PUT_PROFILE};
use crate::{record, RedisDatabase};

/// Profiles stored as one hash per document, plus a lexicographic index of
/// document ids used for prefix search.
#[derive(Clone, Debug)]
pub struct RedisProfileStore {
    db: RedisDatabase,
}

impl RedisProfileStore {
    pub fn new(db: RedisDatabase) -> Self {
        Self { db }
    }

    async fn search_page(
        &self,
        prefix: &Namespace,
        after: Option<String>,
        count: usize,
    ) -> Result<Page<ProfileItem>, StoreError> {
        prefix.validate_prefix()?;
        let id_prefix = prefix.id_prefix();
        let ids: Vec<String> = self
            .db
            .eval(
                PROFILE_PAGE,
                vec![self.db.keys.profile_index()],
                vec![
                    id_prefix.clone(),
                    after.unwrap_or_default(),
                    count.to_string(),
                ],
            )
            .await?;
        let next = if ids.len() < count {
            None
        } else {
            ids.last().cloned()
        };

        let mut items = Vec::with_capacity(ids.len());
        for id in ids.iter().filter(|id| id.starts_with(&id_prefix)) {
            let hash = self.db.hgetall(&self.db.keys.profile_document(id)).await?;
            if hash.is_empty() {
                continue;
            }
            items.push(record::profile(&hash)?);
        }
        Ok(Page { items, next })
    }
}

#[async_trait::async_trait]
impl ProfileStore for RedisProfileStore {
    async fn get(
        &self,
        namespace: &Namespace,
        key: &str,
    ) -> Result<Option<ProfileItem>, StoreError> {
        validate_address(namespace, key)?;
        let document = self.db.keys.profile_document(&namespace.document_id(key));
        let hash = self.db.hgetall(&document).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        record::profile(&hash).map(Some)
    }

    async fn put(
        &self,
        namespace: &Namespace,
        key: &str,
        value: ProfileValue,
    ) -> Result<ProfileItem, StoreError> {
        validate_address(namespace, key)?;
        let document_id = namespace.document_id(key);
        let now = Utc::now();

        let created_at: String = self
            .db
            .eval(
                PUT_PROFILE,
                vec![
                    self.db.keys.profile_document(&document_id),
                    self.db.keys.profile_index(),
                ],
                vec![
                    document_id.clone(),
                    encode_json("profile namespace", namespace)?,
                    key.to_string(),
                    encode_json("profile value", &value)?,
                    format_timestamp(now),
                ],
            )
            .await?;

        tracing::debug!(document_id = %document_id, "stored profile");
        Ok(ProfileItem {
            namespace: namespace.clone(),
            key: key.to_string(),
            value,
            created_at: parse_timestamp("profile", &created_at)?,
            updated_at: now,
        })
    }

    async fn delete(&self, namespace: &Namespace, key: &str) -> Result<(), StoreError> {
        validate_address(namespace, key)?;
        let document_id = namespace.document_id(key);
        let _removed: i64 = self
            .db
            .eval(
                DELETE_PROFILE,
                vec![
                    self.db.keys.profile_document(&document_id),
                    self.db.keys.profile_index(),
                ],
                vec![document_id],
            )
            .await?;
        Ok(())
    }

    fn search<'a>(&'a self, prefix: &'a Namespace, query: SearchQuery) -> ProfileStream<'a> {
        let window = query.window();
        paginate(
            None,
            self.db.config.list_page_size(),
            window,
            move |item: &ProfileItem| query.accepts(item),
            move |after, count| self.search_page(prefix, after, count),
        )
    }
}
