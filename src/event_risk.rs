use crate::error::{MarketError, Result};
use crate::indicators::annualized_volatility;
use crate::models::{Candle, EventCalendar};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const MIN_CANDLES: usize = 21;
const SHORT_VOL_WINDOW: usize = 20;
const LONG_VOL_WINDOW: usize = 120;
const GAP_LOOKBACK_SESSIONS: usize = 5;

const EARNINGS_WEIGHT: f64 = 0.35;
const DIVIDEND_WEIGHT: f64 = 0.10;
const VOLATILITY_WEIGHT: f64 = 0.25;
const GAP_WEIGHT: f64 = 0.15;
const MARKET_STRESS_WEIGHT: f64 = 0.15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRiskConfig {
    pub earnings_window_days: i64,
    pub dividend_window_days: i64,
    pub vol_spike_ratio: f64,
    pub gap_threshold: f64,
    pub vix_threshold: f64,
}

impl Default for EventRiskConfig {
    fn default() -> Self {
        Self {
            earnings_window_days: 3,
            dividend_window_days: 2,
            vol_spike_ratio: 1.5,
            gap_threshold: 0.03,
            vix_threshold: 25.0,
        }
    }
}

impl EventRiskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.earnings_window_days < 0 || self.dividend_window_days < 0 {
            return Err(MarketError::Config(
                "event windows must be non-negative".to_string(),
            ));
        }
        for (name, value) in [
            ("vol_spike_ratio", self.vol_spike_ratio),
            ("gap_threshold", self.gap_threshold),
            ("vix_threshold", self.vix_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(MarketError::Config(format!(
                    "{} must be a positive number (value: {})",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    Elevated,
    High,
    Severe,
}

impl RiskLevel {
    /// Level and position haircut for a combined score.
    pub fn from_score(score: f64) -> (Self, f64) {
        if score < 0.20 {
            (RiskLevel::Low, 0.0)
        } else if score < 0.40 {
            (RiskLevel::Moderate, 0.25)
        } else if score < 0.60 {
            (RiskLevel::Elevated, 0.50)
        } else if score < 0.80 {
            (RiskLevel::High, 0.75)
        } else {
            (RiskLevel::Severe, 1.0)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCondition {
    pub name: String,
    pub triggered: bool,
    pub weight: f64,
    pub detail: String,
}

impl RiskCondition {
    fn new(name: &str, triggered: bool, weight: f64, detail: String) -> Self {
        Self {
            name: name.to_string(),
            triggered,
            weight,
            detail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRiskAssessment {
    pub symbol: String,
    pub assessed_on: NaiveDate,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub haircut: f64,
    pub position_multiplier: f64,
    pub skip_trade: bool,
    pub conditions: Vec<RiskCondition>,
    pub next_earnings_date: Option<NaiveDate>,
    pub days_to_earnings: Option<i64>,
    pub vix: Option<f64>,
}

impl EventRiskAssessment {
    pub fn triggered(&self) -> impl Iterator<Item = &RiskCondition> {
        self.conditions.iter().filter(|c| c.triggered)
    }
}

/// Scores how risky it is to open a position around scheduled events and
/// unusual market conditions.
#[derive(Debug, Clone, Default)]
pub struct EventRiskGuard {
    config: EventRiskConfig,
}

impl EventRiskGuard {
    pub fn new(config: EventRiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EventRiskConfig {
        &self.config
    }

    pub fn assess(
        &self,
        symbol: &str,
        candles: &[Candle],
        calendar: &EventCalendar,
        vix: Option<f64>,
        today: NaiveDate,
    ) -> Result<EventRiskAssessment> {
        if candles.len() < MIN_CANDLES {
            return Err(MarketError::InvalidRequest(format!(
                "at least {} candles are required for event risk on {} (got {})",
                MIN_CANDLES,
                symbol,
                candles.len()
            )));
        }
        if let Some(v) = vix {
            if !v.is_finite() || v < 0.0 {
                return Err(MarketError::InvalidRequest(format!(
                    "vix must be a non-negative number (value: {})",
                    v
                )));
            }
        }

        let (earnings, next_earnings_date, days_to_earnings) =
            self.earnings_condition(calendar, today);
        let conditions = vec![
            earnings,
            self.dividend_condition(calendar, today),
            self.volatility_condition(candles),
            self.gap_condition(candles),
            self.market_stress_condition(vix),
        ];

        let raw_score: f64 = conditions
            .iter()
            .filter(|c| c.triggered)
            .map(|c| c.weight)
            .sum();
        // Round away float noise so 0.35 + 0.25 lands on the 0.60 boundary.
        let risk_score = ((raw_score * 1e6).round() / 1e6).clamp(0.0, 1.0);
        let (risk_level, haircut) = RiskLevel::from_score(risk_score);

        if risk_level != RiskLevel::Low {
            log::info!(
                "Event risk for {}: score {:.2} ({:?}), haircut {:.0}%",
                symbol,
                risk_score,
                risk_level,
                haircut * 100.0
            );
        }

        Ok(EventRiskAssessment {
            symbol: symbol.to_string(),
            assessed_on: today,
            risk_score,
            risk_level,
            haircut,
            position_multiplier: 1.0 - haircut,
            skip_trade: haircut >= 1.0,
            conditions,
            next_earnings_date,
            days_to_earnings,
            vix,
        })
    }

    fn earnings_condition(
        &self,
        calendar: &EventCalendar,
        today: NaiveDate,
    ) -> (RiskCondition, Option<NaiveDate>, Option<i64>) {
        let next = calendar
            .earnings_dates
            .iter()
            .copied()
            .filter(|date| (*date - today).num_days() >= -1)
            .min();
        let days = next.map(|date| (date - today).num_days());
        let triggered = days.is_some_and(|d| d <= self.config.earnings_window_days);
        let detail = match (next, days) {
            (Some(date), Some(d)) => format!("earnings on {} ({} days away)", date, d),
            _ => "no upcoming earnings date".to_string(),
        };
        (
            RiskCondition::new("earnings_proximity", triggered, EARNINGS_WEIGHT, detail),
            next,
            days,
        )
    }

    fn dividend_condition(&self, calendar: &EventCalendar, today: NaiveDate) -> RiskCondition {
        let (triggered, detail) = match calendar.ex_dividend_date {
            Some(date) => {
                let days = (date - today).num_days();
                (
                    (0..=self.config.dividend_window_days).contains(&days),
                    format!("ex-dividend on {} ({} days away)", date, days),
                )
            }
            None => (false, "no ex-dividend date".to_string()),
        };
        RiskCondition::new("dividend_proximity", triggered, DIVIDEND_WEIGHT, detail)
    }

    fn volatility_condition(&self, candles: &[Candle]) -> RiskCondition {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let short = annualized_volatility(&closes, SHORT_VOL_WINDOW);
        let long = annualized_volatility(&closes, LONG_VOL_WINDOW);
        let triggered = long > 0.0 && short > self.config.vol_spike_ratio * long;
        RiskCondition::new(
            "volatility_spike",
            triggered,
            VOLATILITY_WEIGHT,
            format!("20d vol {:.1}% vs long-run {:.1}%", short * 100.0, long * 100.0),
        )
    }

    fn gap_condition(&self, candles: &[Candle]) -> RiskCondition {
        let start = candles.len().saturating_sub(GAP_LOOKBACK_SESSIONS).max(1);
        let largest = (start..candles.len())
            .filter(|&i| candles[i - 1].close > 0.0)
            .map(|i| (candles[i].open / candles[i - 1].close - 1.0).abs())
            .fold(0.0_f64, f64::max);
        RiskCondition::new(
            "recent_gap",
            largest >= self.config.gap_threshold,
            GAP_WEIGHT,
            format!("largest gap in last {} sessions {:.2}%", GAP_LOOKBACK_SESSIONS, largest * 100.0),
        )
    }

    fn market_stress_condition(&self, vix: Option<f64>) -> RiskCondition {
        let (triggered, detail) = match vix {
            Some(v) => (
                v >= self.config.vix_threshold,
                format!("VIX {:.1} (threshold {:.1})", v, self.config.vix_threshold),
            ),
            None => (false, "VIX not provided".to_string()),
        };
        RiskCondition::new("market_stress", triggered, MARKET_STRESS_WEIGHT, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::tests::candles_from_closes;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
    }

    fn calm_closes(len: usize, step: f64) -> Vec<f64> {
        let mut closes = vec![100.0];
        for i in 1..len {
            let factor = if i % 2 == 0 { 1.0 + step } else { 1.0 - step };
            closes.push(closes[i - 1] * factor);
        }
        closes
    }

    fn calendar() -> EventCalendar {
        EventCalendar::empty("AAA")
    }

    #[test]
    fn quiet_market_is_low_risk() {
        let candles = candles_from_closes("AAA", &calm_closes(130, 0.002));
        let assessment = EventRiskGuard::default()
            .assess("AAA", &candles, &calendar(), Some(14.0), today())
            .unwrap();
        assert_eq!(assessment.risk_level, RiskLevel::Low);
        assert_eq!(assessment.risk_score, 0.0);
        assert_eq!(assessment.position_multiplier, 1.0);
        assert!(!assessment.skip_trade);
        assert_eq!(assessment.conditions.len(), 5);
        assert!(assessment.next_earnings_date.is_none());
    }

    #[test]
    fn earnings_and_volatility_reach_high() {
        // 2.5% swings stay under the gap threshold.
        let mut closes = calm_closes(110, 0.002);
        let tail = calm_closes(21, 0.025);
        let scale = closes[closes.len() - 1] / tail[0];
        closes.extend(tail[1..].iter().map(|c| c * scale));
        let candles = candles_from_closes("AAA", &closes);

        let mut cal = calendar();
        cal.earnings_dates = vec![
            today() - chrono::Duration::days(30),
            today() + chrono::Duration::days(2),
        ];

        let assessment = EventRiskGuard::default()
            .assess("AAA", &candles, &cal, None, today())
            .unwrap();
        let triggered: Vec<&str> = assessment.triggered().map(|c| c.name.as_str()).collect();
        assert_eq!(triggered, vec!["earnings_proximity", "volatility_spike"]);
        assert_eq!(assessment.risk_score, 0.6);
        assert_eq!(assessment.risk_level, RiskLevel::High);
        assert_eq!(assessment.haircut, 0.75);
        assert_eq!(assessment.days_to_earnings, Some(2));
        assert_eq!(
            assessment.next_earnings_date,
            Some(today() + chrono::Duration::days(2))
        );
    }

    #[test]
    fn earnings_yesterday_still_counts() {
        let candles = candles_from_closes("AAA", &calm_closes(40, 0.002));
        let mut cal = calendar();
        cal.earnings_dates = vec![today() - chrono::Duration::days(1)];
        let assessment = EventRiskGuard::default()
            .assess("AAA", &candles, &cal, None, today())
            .unwrap();
        assert!(assessment.conditions[0].triggered);
        assert_eq!(assessment.risk_level, RiskLevel::Moderate);
        assert_eq!(assessment.haircut, 0.25);
    }

    #[test]
    fn gap_dividend_and_vix_are_scored() {
        let mut candles = candles_from_closes("AAA", &calm_closes(60, 0.002));
        let n = candles.len();
        candles[n - 2].open = candles[n - 3].close * 1.05;

        let mut cal = calendar();
        cal.ex_dividend_date = Some(today() + chrono::Duration::days(1));

        let assessment = EventRiskGuard::default()
            .assess("AAA", &candles, &cal, Some(31.0), today())
            .unwrap();
        let triggered: Vec<&str> = assessment.triggered().map(|c| c.name.as_str()).collect();
        assert_eq!(triggered, vec!["dividend_proximity", "recent_gap", "market_stress"]);
        assert!((assessment.risk_score - 0.40).abs() < 1e-9);
        assert_eq!(assessment.risk_level, RiskLevel::Elevated);
    }

    #[test]
    fn everything_at_once_skips_trade() {
        let mut closes = calm_closes(110, 0.002);
        let tail = calm_closes(21, 0.03);
        let scale = closes[closes.len() - 1] / tail[0];
        closes.extend(tail[1..].iter().map(|c| c * scale));
        let mut candles = candles_from_closes("AAA", &closes);
        let n = candles.len();
        candles[n - 1].open = candles[n - 2].close * 0.95;

        let mut cal = calendar();
        cal.earnings_dates = vec![today()];
        cal.ex_dividend_date = Some(today());

        let assessment = EventRiskGuard::default()
            .assess("AAA", &candles, &cal, Some(40.0), today())
            .unwrap();
        assert_eq!(assessment.risk_score, 1.0);
        assert_eq!(assessment.risk_level, RiskLevel::Severe);
        assert!(assessment.skip_trade);
        assert_eq!(assessment.position_multiplier, 0.0);
    }

    #[test]
    fn short_history_is_rejected() {
        let candles = candles_from_closes("AAA", &calm_closes(20, 0.002));
        let err = EventRiskGuard::default()
            .assess("AAA", &candles, &calendar(), None, today())
            .unwrap_err();
        assert!(matches!(err, MarketError::InvalidRequest(_)));

        let candles = candles_from_closes("AAA", &calm_closes(MIN_CANDLES, 0.002));
        let assessment = EventRiskGuard::default()
            .assess("AAA", &candles, &calendar(), None, today())
            .unwrap();
        assert_eq!(assessment.conditions.len(), 5);
    }

    #[test]
    fn short_series_measure_long_run_vol_over_all_history() {
        // 80 bars: fewer than the 120-return long window.
        let mut closes = calm_closes(60, 0.002);
        let tail = calm_closes(21, 0.025);
        let scale = closes[closes.len() - 1] / tail[0];
        closes.extend(tail[1..].iter().map(|c| c * scale));
        assert!(closes.len() <= LONG_VOL_WINDOW);
        let candles = candles_from_closes("AAA", &closes);

        let assessment = EventRiskGuard::default()
            .assess("AAA", &candles, &calendar(), None, today())
            .unwrap();
        let spike = assessment
            .conditions
            .iter()
            .find(|c| c.name == "volatility_spike")
            .unwrap();
        let long = annualized_volatility(&closes, closes.len());
        assert!(long > 0.0);
        assert!(spike
            .detail
            .ends_with(&format!("long-run {:.1}%", long * 100.0)));
        // Short vol is about twice the full-history figure.
        assert!(spike.triggered);
    }

    #[test]
    fn level_boundaries() {
        assert_eq!(RiskLevel::from_score(0.19), (RiskLevel::Low, 0.0));
        assert_eq!(RiskLevel::from_score(0.20), (RiskLevel::Moderate, 0.25));
        assert_eq!(RiskLevel::from_score(0.40), (RiskLevel::Elevated, 0.50));
        assert_eq!(RiskLevel::from_score(0.60), (RiskLevel::High, 0.75));
        assert_eq!(RiskLevel::from_score(0.80), (RiskLevel::Severe, 1.0));
    }
}
