use panebridge::{AppResult, app::App, cli::Cli, config::Config, init_logging, ui::cli::display_error};

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config_path();
    let config = Config::load_or_default(&config_path);

    // Initialize logging
    let log_guard = init_logging(&cli.effective_log_level(&config), &config.log)?;

    tracing::debug!("CLI arguments: {:?}", cli);
    tracing::debug!("Configuration file: {}", config_path.display());

    let app = App::new(cli, config)?;
    let status = match app.run().await {
        Ok(status) => status,
        Err(e) => {
            display_error(&format!("{:#}", e));
            tracing::debug!("Command failed: {:?}", e);
            panebridge::app::ExitStatus::Failure
        }
    };

    if status.code() != 0 {
        drop(log_guard);
        std::process::exit(status.code());
    }
    Ok(())
}
