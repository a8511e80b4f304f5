use std::net::SocketAddr;
use std::thread;

use axum::Router;
use camino::Utf8PathBuf;
use console::style;
use tower_http::services::ServeDir;
use tracing::{error, info};

/// Serves `dir` over HTTP on `port` from a dedicated thread. A failure to
/// bind or serve is logged from that thread and returned through the handle.
pub fn start(dir: Utf8PathBuf, port: u16) -> thread::JoinHandle<Result<(), anyhow::Error>> {
    info!(url = %style(format!("http://localhost:{port}/")).yellow(), "starting a HTTP server");

    thread::spawn(move || {
        let result = run(dir, port);
        if let Err(e) = &result {
            error!("HTTP server on port {port} stopped: {e:#}");
        }
        result
    })
}

fn run(dir: Utf8PathBuf, port: u16) -> Result<(), anyhow::Error> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(serve(dir, port))
}

async fn serve(dir: Utf8PathBuf, port: u16) -> Result<(), anyhow::Error> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let address = tokio::net::TcpListener::bind(address).await?;

    let router = Router::new().fallback_service(ServeDir::new(dir.as_std_path()));

    axum::serve(address, router).await?;

    Ok(())
}
