pub mod config;
pub mod sensors;
pub mod server;

use std::sync::Arc;

use self::config::Config;

/// In order to let the integration test directly use the coap-server
/// crate and start the server, a function is opened to replace the main
/// function to directly start the server.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    server::run(config).await
}
