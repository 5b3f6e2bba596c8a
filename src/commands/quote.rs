use crate::context::AppContext;
use anyhow::Result;

pub async fn run(app: &AppContext, symbol: &str) -> Result<()> {
    let quote = app.quote(symbol).await?;
    super::print_json(&quote)
}
