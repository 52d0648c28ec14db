use crate::config::{self, AppSettings};
use crate::db::SqliteStore;
use crate::llm::ModelInfo;
use std::collections::HashMap;
use std::sync::Arc;
use tauri::State;

type Store<'a> = State<'a, Arc<SqliteStore>>;

#[tauri::command]
pub fn get_settings(store: Store<'_>) -> Result<HashMap<String, String>, String> {
    config::masked_settings(&store).map_err(|e| e.to_string())
}

/// Provider keys and the model apply to the next message; `user_id` and
/// `message_window` take effect on restart.
#[tauri::command]
pub fn set_setting(store: Store<'_>, key: String, value: String) -> Result<(), String> {
    config::update_setting(&store, &key, &value).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn delete_setting(store: Store<'_>, key: String) -> Result<(), String> {
    config::remove_setting(&store, &key).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn get_available_models(store: Store<'_>) -> Result<Vec<ModelInfo>, String> {
    let settings = AppSettings::load(&store).map_err(|e| e.to_string())?;
    Ok(config::available_models(&settings))
}
