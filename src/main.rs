//! Strata server entry point
//!
//! Serves:
//! - schema export/import at /api/schema
//! - node CRUD at /api/nodes/{type}
//! - template rendering at /api/render
//! - file content upload at /api/files/{id}/content
//! - health check at /healthz

use strata::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults to 0.0.0.0:3004 with data under ./data
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
