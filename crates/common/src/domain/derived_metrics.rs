//! Efficiency metrics derived from raw heat-pump sensor readings.
//!
//! Every function here is total: missing or non-numeric inputs yield `None`
//! and propagate downstream instead of failing the ingest.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Water density in kg/L.
pub const WATER_DENSITY: f64 = 0.997;

/// Specific heat capacity of water in kJ/(kg·K).
pub const WATER_SPECIFIC_HEAT: f64 = 4.186;

/// Electrical input below this (kW) is treated as "compressor off" and no
/// measured COP is produced.
pub const MIN_POWER_KW_FOR_COP: f64 = 0.05;

/// How a coefficient of performance was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopQuality {
    Measured,
    Estimated,
}

impl CopQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopQuality::Measured => "measured",
            CopQuality::Estimated => "estimated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "measured" => Some(CopQuality::Measured),
            "estimated" => Some(CopQuality::Estimated),
            _ => None,
        }
    }
}

/// Metrics computed from a raw sample at ingest time
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub delta_t: Option<f64>,
    pub thermal_kw: Option<f64>,
    pub cop: Option<f64>,
    pub cop_quality: Option<CopQuality>,
}

/// Round half away from zero at `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Reads a finite JSON number. Strings, booleans and nulls are not numeric.
fn numeric(metrics: &Map<String, Value>, key: &str) -> Option<f64> {
    metrics
        .get(key)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
}

/// Derive delta-T, thermal output and COP from a raw `metrics` object.
pub fn derive_metrics(metrics: &Map<String, Value>) -> DerivedMetrics {
    let delta_t = match (numeric(metrics, "supplyC"), numeric(metrics, "returnC")) {
        (Some(supply), Some(ret)) => Some(round_to(supply - ret, 1)),
        _ => None,
    };

    let thermal_kw = match (delta_t, numeric(metrics, "flowLps")) {
        (Some(dt), Some(flow)) => Some(round_to(
            WATER_DENSITY * WATER_SPECIFIC_HEAT * flow * dt / 1000.0,
            2,
        )),
        _ => None,
    };

    let power_kw = numeric(metrics, "powerKW");

    let (cop, cop_quality) = match (thermal_kw, power_kw) {
        (Some(thermal), Some(power)) if power > MIN_POWER_KW_FOR_COP => {
            (Some(round_to(thermal / power, 2)), Some(CopQuality::Measured))
        }
        (Some(_), _) => (None, Some(CopQuality::Estimated)),
        (None, _) => (None, None),
    };

    DerivedMetrics {
        delta_t,
        thermal_kw,
        cop,
        cop_quality,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metrics(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_delta_t_from_supply_and_return() {
        let derived = derive_metrics(&metrics(json!({"supplyC": 47, "returnC": 38})));
        assert_eq!(derived.delta_t, Some(9.0));
        assert_eq!(derived.thermal_kw, None);
        assert_eq!(derived.cop, None);
        assert_eq!(derived.cop_quality, None);
    }

    #[test]
    fn test_thermal_output_uses_fixed_constants() {
        let derived = derive_metrics(&metrics(
            json!({"supplyC": 47, "returnC": 38, "flowLps": 0.32}),
        ));
        assert_eq!(derived.delta_t, Some(9.0));
        // 0.997 * 4.186 * 0.32 * 9 / 1000 = 0.01202
        assert_eq!(derived.thermal_kw, Some(0.01));
    }

    #[test]
    fn test_measured_cop_when_power_present() {
        let derived = derive_metrics(&metrics(json!({
            "supplyC": 47, "returnC": 38, "flowLps": 32.0, "powerKW": 1.4
        })));
        assert_eq!(derived.thermal_kw, Some(1.2));
        assert_eq!(derived.cop, Some(0.86));
        assert_eq!(derived.cop_quality, Some(CopQuality::Measured));
    }

    #[test]
    fn test_estimated_quality_without_power() {
        let derived = derive_metrics(&metrics(json!({
            "supplyC": 47, "returnC": 38, "flowLps": 0.32
        })));
        assert_eq!(derived.cop, None);
        assert_eq!(derived.cop_quality, Some(CopQuality::Estimated));
    }

    #[test]
    fn test_low_power_is_estimated() {
        let derived = derive_metrics(&metrics(json!({
            "supplyC": 47, "returnC": 38, "flowLps": 32.0, "powerKW": 0.05
        })));
        assert_eq!(derived.cop, None);
        assert_eq!(derived.cop_quality, Some(CopQuality::Estimated));
    }

    #[test]
    fn test_non_numeric_inputs_propagate_null() {
        let derived = derive_metrics(&metrics(json!({
            "supplyC": "47", "returnC": 38, "flowLps": 0.32, "powerKW": 1.4
        })));
        assert_eq!(derived, DerivedMetrics::default());

        let derived = derive_metrics(&Map::new());
        assert_eq!(derived, DerivedMetrics::default());
    }

    #[test]
    fn test_negative_delta_t() {
        let derived = derive_metrics(&metrics(json!({"supplyC": 30.0, "returnC": 35.25})));
        assert_eq!(derived.delta_t, Some(-5.3));
    }

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_to(2.25, 1), 2.3);
        assert_eq!(round_to(-2.25, 1), -2.3);
        assert_eq!(round_to(0.125, 2), 0.13);
    }

    #[test]
    fn test_cop_quality_parse_round_trip() {
        assert_eq!(CopQuality::parse("measured"), Some(CopQuality::Measured));
        assert_eq!(CopQuality::parse(CopQuality::Estimated.as_str()), Some(CopQuality::Estimated));
        assert_eq!(CopQuality::parse("guessed"), None);
    }
}
