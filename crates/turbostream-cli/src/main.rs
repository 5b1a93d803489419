//! TurboStream CLI binary

#[tokio::main]
async fn main() {
    if let Err(e) = turbostream_cli::run().await {
        eprintln!("{} error: {}", e.category(), e);
        for hint in e.suggestions() {
            eprintln!("  hint: {hint}");
        }
        std::process::exit(e.exit_code());
    }
}
