use anyhow::{Context, Result};
use interceptor_relay::config::{LoggingSettings, Settings};
use interceptor_relay::Application;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new().context("failed to load configuration")?;
    init_tracing(&settings.logging);

    let app = Application::new(settings)
        .await
        .context("failed to start interceptor relay")?;
    app.run().await?;

    Ok(())
}

/// `RUST_LOG` wins over `logging.level` when set
fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("pretty") {
        builder.pretty().init();
    } else {
        builder.json().init();
    }
}
