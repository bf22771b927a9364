// Binary entry point for iris
// This is a thin wrapper that delegates to the library implementation

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    iris_core::cli::run().await
}
