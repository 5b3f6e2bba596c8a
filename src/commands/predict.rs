use crate::context::AppContext;
use anyhow::Result;
use log::info;

pub async fn run(app: &AppContext, symbol: &str, horizon_days: u32) -> Result<()> {
    let prediction = app.predict(symbol, horizon_days).await?;
    info!(
        "{} target {} on {}: {:.2} ({:+.2}%)",
        prediction.symbol,
        prediction.direction.as_str(),
        prediction.target_date,
        prediction.predicted_price,
        prediction.predicted_return * 100.0
    );
    super::print_json(&prediction)
}
