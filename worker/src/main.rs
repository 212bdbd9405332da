mod agent;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    agent::run().await
}
