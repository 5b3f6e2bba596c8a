use crate::context::AppContext;
use anyhow::Result;

pub async fn run(app: &AppContext) -> Result<()> {
    let gap = app.gap_prediction().await?;
    super::print_json(&gap)
}
