use std::io::Write;
use std::sync::Arc;
use std::thread;

use nbhttp::config::Config;
use nbhttp::http::context::{ContextOptions, FnContext};
use nbhttp::http::request::Request;
use nbhttp::http::writer::ResponseWriter;
use nbhttp::server::Server;

fn status(req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
    resp.set_header("Content-Type", "text/plain");
    writeln!(resp, "{} {}", req.method, req.path)?;
    for (name, value) in &req.params {
        writeln!(resp, "{}={}", name, value)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load();
    let grace = cfg.shutdown_grace();

    let mut server = Server::bind(cfg)?;
    server.add_context(
        "/",
        Arc::new(FnContext(status)),
        ContextOptions {
            accept_encoding: true,
            ..ContextOptions::default()
        },
    );
    let handle = server.handle();
    let serving = thread::spawn(move || server.run());

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())?;
    tracing::info!("Shutdown signal received");

    handle.stop(grace);
    match serving.join() {
        Ok(result) => result,
        Err(_) => anyhow::bail!("server thread panicked"),
    }
}
