// Connection and query execution core for a desktop database browser.
// Embed `Dispatcher` directly, or enable the `tauri` feature and register
// the plugin returned by `init()`.

// Module declarations
pub mod commands;
pub mod config;
pub mod db;
pub mod logging;

pub use commands::{Dispatcher, LoadAck, QueryOutcome};
pub use config::{CoreConfig, MongoOptions, SqliteOptions};
pub use db::{DatabaseError, DatabaseFamily, QueryResult, SessionInfo};

/// Tauri plugin exposing `load`, `close`, `query`, `health` and `sessions`
/// as `plugin:dbconn|<command>`. Plugin config is an optional `CoreConfig`.
#[cfg(feature = "tauri")]
pub fn init<R: tauri::Runtime>() -> tauri::plugin::TauriPlugin<R, Option<CoreConfig>> {
    use tauri::Manager;

    tauri::plugin::Builder::<R, Option<CoreConfig>>::new("dbconn")
        .invoke_handler(tauri::generate_handler![
            commands::ipc::load,
            commands::ipc::close,
            commands::ipc::query,
            commands::ipc::health,
            commands::ipc::sessions,
        ])
        .setup(|app, api| {
            let config = api.config().clone().unwrap_or_default();
            let dispatcher = Dispatcher::new(config);

            // Setup runs outside the async runtime; the reaper needs its context
            let runtime = tauri::async_runtime::handle();
            let _enter = runtime.inner().enter();
            dispatcher.start_idle_reaper();

            app.manage(dispatcher);
            tracing::info!("dbconn plugin ready");
            Ok(())
        })
        .on_event(|app, event| {
            if let tauri::RunEvent::Exit = event {
                if let Some(dispatcher) = app.try_state::<Dispatcher>() {
                    tauri::async_runtime::block_on(dispatcher.close(None));
                }
            }
        })
        .build()
}
