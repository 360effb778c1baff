//! socialstream service host.

use clap::Parser;
use socialstream_server::config::AppConfig;
use socialstream_server::telemetry::init_tracing;
use socialstream_server::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::parse();
    init_tracing(config.log_format)?;

    let app = App::build(config).await?;
    app.run().await
}
