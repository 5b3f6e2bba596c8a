use crate::context::AppContext;
use anyhow::Result;

pub async fn run(app: &AppContext, symbol: &str, vix: Option<f64>) -> Result<()> {
    let assessment = app.event_risk(symbol, vix).await?;
    super::print_json(&assessment)
}
