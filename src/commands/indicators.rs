use crate::context::AppContext;
use crate::models::HistoryRange;
use anyhow::Result;

pub async fn run(app: &AppContext, symbol: &str, range: HistoryRange) -> Result<()> {
    let overview = app.stock_overview(symbol, range).await?;
    super::print_json(&overview)
}
