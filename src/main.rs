//! Portico gateway binary
//!
//! Run with: cargo run --bin portico -- serve

#[tokio::main]
async fn main() {
    // Load .env before anything reads configuration. Logging comes up
    // inside the CLI once the config file has been read.
    let _ = dotenvy::dotenv();

    if let Err(e) = portico::cli::run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
