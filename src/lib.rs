pub mod auth;
#[cfg(feature = "shell")]
mod commands;
pub mod config;
pub mod db;
pub mod llm;
pub mod repository;
pub mod state;

#[cfg(feature = "shell")]
pub use shell::run;

#[cfg(feature = "shell")]
mod shell {
    use crate::auth::CurrentUser;
    use crate::commands;
    use crate::config::AppSettings;
    use crate::db::SqliteStore;
    use crate::llm::ConfiguredGenerator;
    use crate::repository::ChatRepository;
    use crate::state::{ChatOptions, ChatViewModel};
    use log::{info, warn};
    use std::sync::Arc;
    use tauri::{Emitter, Manager};

    #[cfg_attr(mobile, tauri::mobile_entry_point)]
    pub fn run() {
        tauri::Builder::default()
            .plugin(
                tauri_plugin_log::Builder::new()
                    .level(log::LevelFilter::Info)
                    .build(),
            )
            .plugin(tauri_plugin_opener::init())
            .setup(|app| {
                let app_dir = app.path().app_data_dir()?;
                let store = Arc::new(SqliteStore::new(&app_dir)?);
                let user = CurrentUser::load_or_create(&store)?;
                let settings = AppSettings::load(&store)?;
                info!("[startup] data dir {:?}, user {}", app_dir, user.id());

                let repo = Arc::new(ChatRepository::new(store.clone(), user.id()));
                let generator = Arc::new(ConfiguredGenerator::new(store.clone()));
                // Built on the async runtime so error dismissal timers can be spawned.
                let view_model = tauri::async_runtime::block_on(async {
                    ChatViewModel::new(repo, generator, ChatOptions::from(&settings))
                });

                let mut updates = view_model.subscribe();
                let handle = app.handle().clone();
                tauri::async_runtime::spawn(async move {
                    while updates.changed().await.is_ok() {
                        let snapshot = updates.borrow_and_update().clone();
                        if let Err(e) = handle.emit("chat-state", snapshot) {
                            warn!("[startup] failed to forward chat state: {}", e);
                        }
                    }
                });

                app.manage(store);
                app.manage(view_model);
                Ok(())
            })
            .invoke_handler(tauri::generate_handler![
                commands::chat::get_chat_state,
                commands::chat::create_session,
                commands::chat::select_session,
                commands::chat::send_message,
                commands::chat::delete_session,
                commands::chat::rename_session,
                commands::chat::dismiss_error,
                commands::settings::get_settings,
                commands::settings::set_setting,
                commands::settings::delete_setting,
                commands::settings::get_available_models,
            ])
            .run(tauri::generate_context!())
            .expect("error while running tauri application");
    }
}
