use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use showrunner::app::App;
use showrunner::config::Config;
use showrunner::{api, jobs};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,librqbit=warn"));
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "showrunner starting");

    let app = App::new(config).await?;
    app.backends.restore_all().await;

    let jobs = jobs::start(
        &app.config,
        app.aggregator.clone(),
        app.housekeeper.clone(),
        app.backlog.clone(),
    );

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(api::serve(
        app.rpc_state(),
        app.config.rpc_port,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    shutdown.cancel();
    jobs.shutdown().await;
    app.shutdown().await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "rpc server error"),
        Err(e) => error!(error = %e, "rpc server task panicked"),
    }
    Ok(())
}
