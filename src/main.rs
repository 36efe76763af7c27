//! funnelsync service: scheduler plus HTTP trigger surface.

use std::net::SocketAddr;
use std::sync::Arc;

use funnelsync::config::AppConfig;
use funnelsync::scheduler::Scheduler;
use funnelsync::server;
use funnelsync::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load();
    let state = Arc::new(AppState::new(config));

    // Open once at startup so schema migrations run (and fail) before we
    // accept any trigger.
    state.open_db()?;

    if state.config.schedule.enabled {
        let scheduler = Scheduler::new(Arc::clone(&state));
        tokio::spawn(async move {
            scheduler.run().await;
        });
    } else {
        log::info!("Scheduler disabled; sync runs only on HTTP/CLI triggers");
    }

    let addr: SocketAddr = state.config.bind_address.parse()?;
    let app = server::router(Arc::clone(&state));

    log::info!("funnelsync listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
