//! Search the metadata service and download an artifact by name.
//!
//! Usage: cargo run --example fetch_artifact -- "Small Divide"

use armory_dl::{Category, DownloadSession, EngineConfig};
use std::env;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let name = env::args().nth(1).unwrap_or_else(|| "Small Divide".to_string());

    let config = EngineConfig::default().writepath("./downloads");
    let mut session = DownloadSession::new(config)?;
    session.engine().set_progress_listener(|done, total| {
        if total > 0 {
            eprint!("\r{done}/{total} bytes");
        }
    });

    let found = session.search(Some(Category::Map), &name).await?;
    println!("{found} result(s) for '{name}'");
    for index in 0..found {
        session.queue(index);
    }

    let code = session.start().await?;
    for job in session.results() {
        println!("{} -> {:?} ({:?})", job.name, job.path, job.state);
    }
    std::process::exit(code);
}
