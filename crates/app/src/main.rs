use std::process::ExitCode;

use chatwire::settings::SettingsStore;
use chatwire::{logging, shell};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let store = SettingsStore::load();
    let settings = store.settings();
    logging::init(&settings.log_filter);
    tracing::debug!(path = ?store.config_path(), "loaded settings");
    match store.ensure_config_file() {
        Ok(true) => tracing::info!(path = ?store.config_path(), "wrote default settings file"),
        Ok(false) => {}
        Err(error) => tracing::warn!(error = %error, "failed to write default settings file"),
    }

    match shell::run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "chatwire exited with an error");
            ExitCode::FAILURE
        }
    }
}
