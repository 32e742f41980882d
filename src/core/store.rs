//! Read-only view of the configuration store.
//!
//! Providers, groups, memberships and API keys are administered elsewhere.
//! The gateway only needs the three lookups on [`ConfigStore`].

use crate::core::models::{Group, GroupId, GroupProvider, StoredApiKey};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("configuration store unavailable: {0}")]
    Unavailable(String),

    #[error("configuration store returned invalid data: {0}")]
    InvalidData(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::InvalidData(err.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_group_by_slug(&self, slug: &str) -> Result<Option<Group>, StoreError>;

    /// Members of a group that are enabled both as providers and as members.
    async fn get_enabled_providers_for_group(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<GroupProvider>, StoreError>;

    async fn list_all_api_keys(&self) -> Result<Vec<StoredApiKey>, StoreError>;
}

#[derive(Default)]
struct StaticState {
    groups: HashMap<String, Group>,
    members: HashMap<GroupId, Vec<GroupProvider>>,
    api_keys: Vec<StoredApiKey>,
}

/// In-memory [`ConfigStore`] for tests, benches and single-file setups.
#[derive(Clone, Default)]
pub struct StaticConfigStore {
    state: Arc<RwLock<StaticState>>,
}

impl StaticConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_group(&self, group: Group) {
        if let Ok(mut state) = self.state.write() {
            state.groups.insert(group.slug.clone(), group);
        }
    }

    pub fn add_member(&self, group_id: GroupId, member: GroupProvider) {
        if let Ok(mut state) = self.state.write() {
            state.members.entry(group_id).or_default().push(member);
        }
    }

    pub fn insert_api_key(&self, key: StoredApiKey) {
        if let Ok(mut state) = self.state.write() {
            state.api_keys.retain(|k| k.record.id != key.record.id);
            state.api_keys.push(key);
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StaticState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("static store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn get_group_by_slug(&self, slug: &str) -> Result<Option<Group>, StoreError> {
        Ok(self.read()?.groups.get(slug).cloned())
    }

    async fn get_enabled_providers_for_group(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<GroupProvider>, StoreError> {
        Ok(self
            .read()?
            .members
            .get(&group_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.is_effectively_enabled())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_all_api_keys(&self) -> Result<Vec<StoredApiKey>, StoreError> {
        Ok(self.read()?.api_keys.clone())
    }
}
