mod session_bus;
mod session_controller;
mod session_store;

pub use session_bus::{SessionBus, SessionSignal};
pub use session_controller::{
    spawn_session_listener, SessionController, CHANGE_PASSWORD_PATH, LOGIN_PATH, LOGOUT_PATH,
    PROFILE_PATH, REGISTER_PATH,
};
pub use session_store::{
    FileBackend, KeyringBackend, MemoryBackend, PersistedSession, SessionStore, StorageBackend,
    KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_USER,
};
