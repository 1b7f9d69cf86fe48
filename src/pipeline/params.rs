//! # Analysis parameters broadcast at run start.
//!
//! [`AnalysisParams`] travels as the `parameters` object of `ConfigBroadcast`;
//! agents read the fields they need from it.
//!
//! ```
//! use pipevisor::AnalysisParams;
//!
//! let params: AnalysisParams = serde_json::from_str(r#"{ "timeframes": ["1h", "4h"] }"#).unwrap();
//! assert_eq!(params.weeks, 50);
//! assert_eq!(params.timeframes, vec!["1h", "4h"]);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static parameters of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisParams {
    /// History depth in weeks.
    pub weeks: u32,
    /// Size of the market-cap universe considered.
    pub top_n: u32,
    /// Minimum |correlation| kept by the join.
    pub correlation_threshold: f64,
    /// RSI look-back period.
    pub rsi_period: u32,
    /// One job per timeframe.
    pub timeframes: Vec<String>,
    /// Market-cap percentile below which a coin counts as low-cap.
    pub low_cap_percentile: f64,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            weeks: 50,
            top_n: 200,
            correlation_threshold: 0.7,
            rsi_period: 14,
            timeframes: vec!["1d".to_string()],
            low_cap_percentile: 25.0,
        }
    }
}

impl AnalysisParams {
    /// JSON object form, as carried by `ConfigBroadcast`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    /// Reads parameters back from a `ConfigBroadcast` payload value.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_form_is_an_object() {
        let params = AnalysisParams::default();
        let value = params.to_value();
        assert!(value.is_object());
        assert_eq!(value["correlation_threshold"], 0.7);
        assert_eq!(AnalysisParams::from_value(&value).unwrap(), params);
    }
}
