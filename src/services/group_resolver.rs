//! Group and membership lookup, cached in front of the configuration store.

use crate::core::cache::{self, CacheStore};
use crate::core::cache_keys;
use crate::core::models::{Group, GroupProvider};
use crate::core::store::{ConfigStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Resolves group slugs and their provider lists.
///
/// The cache is expected to be process-local: member snapshots carry
/// decrypted upstream credentials.
#[derive(Clone)]
pub struct GroupResolver {
    store: Arc<dyn ConfigStore>,
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl GroupResolver {
    pub fn new(store: Arc<dyn ConfigStore>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            cache,
            ttl: cache_keys::GROUP_TTL,
        }
    }

    pub async fn group_by_slug(&self, slug: &str) -> Result<Option<Group>, StoreError> {
        let key = cache_keys::group_by_slug(slug);
        match cache::get_json::<Group>(self.cache.as_ref(), &key).await {
            Ok(Some(group)) => return Ok(Some(group)),
            Ok(None) => {}
            Err(e) => tracing::warn!(group = %slug, error = %e, "Group cache read failed"),
        }

        let group = self.store.get_group_by_slug(slug).await?;
        if let Some(group) = &group {
            if let Err(e) = cache::set_json(self.cache.as_ref(), &key, group, self.ttl).await {
                tracing::warn!(group = %slug, error = %e, "Group cache write failed");
            }
        }
        Ok(group)
    }

    /// Effectively enabled members of `group`. Empty lists are not cached so
    /// a newly attached provider shows up on the next request.
    pub async fn providers_for_group(&self, group: &Group) -> Result<Vec<GroupProvider>, StoreError> {
        let key = cache_keys::group_endpoints(group.id);
        match cache::get_json::<Vec<GroupProvider>>(self.cache.as_ref(), &key).await {
            Ok(Some(members)) => return Ok(members),
            Ok(None) => {}
            Err(e) => tracing::warn!(group = %group.slug, error = %e, "Member cache read failed"),
        }

        let members = self.store.get_enabled_providers_for_group(group.id).await?;
        if !members.is_empty() {
            if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &members, self.ttl).await {
                tracing::warn!(group = %group.slug, error = %e, "Member cache write failed");
            }
        }
        Ok(members)
    }
}
