use crate::context::AppContext;
use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde_json::json;

pub async fn run(app: &AppContext, as_of: Option<NaiveDate>) -> Result<()> {
    let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
    let summary = app.evaluate_due_predictions(as_of).await?;
    let accuracy = app.prediction_accuracy(None).await?;
    super::print_json(&json!({
        "evaluation": summary,
        "accuracy": accuracy,
    }))
}
