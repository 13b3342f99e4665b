use queue_reader_cli::run_cli;
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        error!(error = %e, "queue-reader failed");
        // Logging may not be installed yet when settings or flags are invalid.
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}
