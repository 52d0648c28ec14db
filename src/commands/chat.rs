use crate::state::{ChatError, ChatState, ChatViewModel};
use tauri::State;

#[tauri::command]
pub fn get_chat_state(chat: State<'_, ChatViewModel>) -> ChatState {
    chat.state()
}

#[tauri::command]
pub async fn create_session(chat: State<'_, ChatViewModel>) -> Result<String, ChatError> {
    chat.create_new_session().await
}

#[tauri::command]
pub fn select_session(chat: State<'_, ChatViewModel>, session_id: String) {
    chat.select_session(&session_id);
}

#[tauri::command]
pub async fn send_message(chat: State<'_, ChatViewModel>, content: String) -> Result<(), ChatError> {
    chat.send_message(&content).await
}

#[tauri::command]
pub async fn delete_session(
    chat: State<'_, ChatViewModel>,
    session_id: String,
) -> Result<(), ChatError> {
    chat.delete_session(&session_id).await
}

#[tauri::command]
pub async fn rename_session(
    chat: State<'_, ChatViewModel>,
    session_id: String,
    title: String,
) -> Result<(), ChatError> {
    chat.rename_session(&session_id, &title).await
}

#[tauri::command]
pub fn dismiss_error(chat: State<'_, ChatViewModel>) {
    chat.dismiss_error();
}
