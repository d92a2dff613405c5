use std::process::ExitCode;

use ember::host::{Host, spawn_stdin_reader};
use ember::settings::SettingsStore;
use ember_llm::spawn_worker;
use ember_session::SessionRuntime;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so they never interleave with the transcript on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = SettingsStore::load();
    let current = settings.settings();
    tracing::info!(
        config_path = %settings.config_path().display(),
        model_id = %current.provider.model_id,
        has_api_key = current.provider.is_valid(),
        "settings loaded"
    );

    let worker = spawn_worker(current.provider.to_worker_config());
    let (runtime, client, snapshots) =
        SessionRuntime::new(worker, current.session.to_controller_config());
    let runtime_task = tokio::spawn(runtime.run());

    let host = Host::new(client, snapshots, &settings, tokio::io::stdout());
    let outcome = host.run(spawn_stdin_reader()).await;

    // The host owned the last client; the runtime winds down and aborts the worker.
    if let Err(error) = runtime_task.await {
        tracing::error!(error = %error, "session runtime task failed");
    }

    match outcome {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "terminal host failed");
            ExitCode::FAILURE
        }
    }
}
