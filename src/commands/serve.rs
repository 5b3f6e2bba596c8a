use crate::context::AppContext;
use crate::server;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext) -> Result<()> {
    info!(
        "Starting REST server on {} with {} data",
        app.settings().bind_address(),
        app.provider_name()
    );
    server::serve(app.clone()).await
}
