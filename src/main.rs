//! Wharf demo server CLI

use std::path::Path;
use std::process;
use std::sync::Arc;

use wharf::config::Config;
use wharf::server::Listener;
use wharf::static_files::StaticFileController;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 || args[1] != "serve" {
        eprintln!("Wharf v{}", env!("CARGO_PKG_VERSION"));
        eprintln!();
        eprintln!("Usage: wharf serve <config.toml>");
        eprintln!();
        eprintln!("Serves static files from the docroot given in the config file.");
        process::exit(1);
    }

    let config = match Config::from_file(Path::new(&args[2])) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let handler = Arc::new(StaticFileController::new(config.static_files.clone()));
    let listener = match Listener::bind(config, handler).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Cannot start server: {e}");
            process::exit(1);
        }
    };

    let shutdown = listener.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown.shutdown();
    });

    if let Err(e) = listener.run().await {
        eprintln!("Server error: {e}");
        process::exit(1);
    }
}
