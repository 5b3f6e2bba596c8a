use crate::error::{MarketError, Result};
use std::collections::HashMap;

/// Extract a parameter as f64 with a default value, ignoring non-finite input
pub fn get_param_f64(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

/// Longest lookback a strategy may request.
pub const MAX_PERIOD: usize = 10_000;

/// Extract a lookback period, rounded and floored at `min`; anything past
/// `MAX_PERIOD` (including a floor derived from another period) is rejected
pub fn get_param_usize_at_least(
    params: &HashMap<String, f64>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let requested = params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .map(f64::round);
    let period = match requested {
        Some(value) if value > MAX_PERIOD as f64 => None,
        Some(value) => Some((value.max(0.0) as usize).max(min)),
        None => Some(default.max(min)),
    };
    period.filter(|p| *p <= MAX_PERIOD).ok_or_else(|| {
        MarketError::InvalidRequest(format!(
            "Parameter {} must resolve to at most {} (value: {})",
            key,
            MAX_PERIOD,
            requested.map_or_else(|| format!("at least {}", min), |v| v.to_string())
        ))
    })
}

/// Interpret a numeric parameter as an on/off switch
pub fn get_param_flag(params: &HashMap<String, f64>, key: &str, default: bool) -> bool {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .map(|v| v >= 0.5)
        .unwrap_or(default)
}

/// Parse `key=value` pairs as given on the command line
pub fn parse_param_pairs(pairs: &[String]) -> Result<HashMap<String, f64>> {
    let mut params = HashMap::with_capacity(pairs.len());
    for pair in pairs {
        let (key, raw) = pair.split_once('=').ok_or_else(|| {
            MarketError::InvalidRequest(format!("Parameter '{}' must look like key=value", pair))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(MarketError::InvalidRequest(format!(
                "Parameter '{}' has an empty key",
                pair
            )));
        }
        let value = raw.trim().parse::<f64>().map_err(|_| {
            MarketError::InvalidRequest(format!("Parameter {} must be a number (value: {})", key, raw))
        })?;
        if !value.is_finite() {
            return Err(MarketError::InvalidRequest(format!(
                "Parameter {} must be finite (value: {})",
                key, raw
            )));
        }
        params.insert(key.to_string(), value);
    }
    Ok(params)
}
