use crate::db::{SqliteStore, StoreError};
use log::info;

const USER_ID_KEY: &str = "user_id";

/// The identity that owns the session collection. Without a sign-in flow
/// this is an anonymous id created on first launch and kept in settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    id: String,
}

impl CurrentUser {
    pub fn load_or_create(store: &SqliteStore) -> Result<Self, StoreError> {
        if let Some(id) = store.get_setting(USER_ID_KEY)?.filter(|id| !id.trim().is_empty()) {
            return Ok(Self { id });
        }
        let id = uuid::Uuid::new_v4().to_string();
        store.set_setting(USER_ID_KEY, &id)?;
        info!("[auth] created anonymous user {}", id);
        Ok(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}
