//! The device's data-point (DPS) map and the raw -> physical decoder.
//!
//! The table below is the single source of truth for decoding, API metadata
//! and export headers. Scale factors are exact decimal divisors so the
//! raw -> physical conversion is drift-free for the documented scales.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug)]
pub struct DpsEntry {
    /// Vendor DPS slot number as reported on the wire.
    pub code: u32,
    /// Short key used by the HTTP API and CSV column ordering.
    pub column: &'static str,
    /// Metric name under which samples are persisted in the store.
    pub metric: &'static str,
    /// Human heading for tabular export.
    pub label: &'static str,
    pub unit: &'static str,
    /// Physical value = raw / divisor.
    pub divisor: u32,
    /// Plausible raw range; values outside are dropped with a warning.
    pub min_raw: i64,
    pub max_raw: i64,
}

pub const DPS_TABLE: &[DpsEntry] = &[
    DpsEntry {
        code: 8,
        column: "temperature",
        metric: "aquarium_temperature_celsius",
        label: "Temperature",
        unit: "°C",
        divisor: 10,
        min_raw: -100,
        max_raw: 1000,
    },
    DpsEntry {
        code: 106,
        column: "ph",
        metric: "aquarium_ph",
        label: "pH",
        unit: "",
        divisor: 100,
        min_raw: 0,
        max_raw: 1400,
    },
    DpsEntry {
        code: 111,
        column: "tds",
        metric: "aquarium_tds_ppm",
        label: "TDS",
        unit: "ppm",
        divisor: 1,
        min_raw: 0,
        max_raw: 20_000,
    },
    DpsEntry {
        code: 116,
        column: "ec",
        metric: "aquarium_ec_uscm",
        label: "EC (Conductivity)",
        unit: "µS/cm",
        divisor: 1,
        min_raw: 0,
        max_raw: 40_000,
    },
    DpsEntry {
        code: 121,
        column: "salinity",
        metric: "aquarium_salinity_ppm",
        label: "Salinity",
        unit: "ppm",
        divisor: 1,
        min_raw: 0,
        max_raw: 50_000,
    },
    DpsEntry {
        code: 126,
        column: "sg",
        metric: "aquarium_specific_gravity",
        label: "Specific Gravity",
        unit: "",
        divisor: 1000,
        min_raw: 0,
        max_raw: 2_000,
    },
    DpsEntry {
        code: 131,
        column: "orp",
        metric: "aquarium_orp_mv",
        label: "ORP",
        unit: "mV",
        divisor: 1,
        min_raw: -2_000,
        max_raw: 2_000,
    },
];

impl DpsEntry {
    /// Column heading for spreadsheet export, e.g. `Temperature (°C)`.
    pub fn export_heading(&self) -> String {
        if self.unit.is_empty() {
            self.label.to_string()
        } else {
            format!("{} ({})", self.label, self.unit)
        }
    }
}

pub fn entry_for_code(code: u32) -> Option<&'static DpsEntry> {
    DPS_TABLE.iter().find(|entry| entry.code == code)
}

pub fn entry_for_column(column: &str) -> Option<&'static DpsEntry> {
    DPS_TABLE.iter().find(|entry| entry.column == column)
}

/// One slot of a device status response, as received on the wire. The value
/// is kept JSON-typed: devices report vendor-internal slots with strings and
/// booleans, and the decoder is the place that rules on integer-ness.
#[derive(Debug, Clone)]
pub struct RawDataPoint {
    pub code: u32,
    pub value: JsonValue,
}

/// A decoded, typed measurement. The timestamp is assigned at decode time
/// (one shared instant per poll cycle), never taken from the device.
#[derive(Debug, Clone, Copy)]
pub struct Reading {
    pub dp: &'static DpsEntry,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    OutOfRange { raw: i64, min: i64, max: i64 },
    NotAnInteger,
}

#[derive(Debug, Clone)]
pub struct DecodeWarning {
    pub code: u32,
    pub metric: &'static str,
    pub reason: DropReason,
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            DropReason::OutOfRange { raw, min, max } => write!(
                f,
                "dropped {} (dps {}): raw value {} outside plausible range {}..={}",
                self.metric, self.code, raw, min, max
            ),
            DropReason::NotAnInteger => write!(
                f,
                "dropped {} (dps {}): raw value is not an integer",
                self.metric, self.code
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct Decoded {
    pub readings: Vec<Reading>,
    pub warnings: Vec<DecodeWarning>,
}

/// Decode one cycle's raw data points against the DPS table.
///
/// Codes absent from the table are dropped silently (devices report extra
/// vendor-internal slots). A malformed or implausible point is dropped with
/// a warning and never affects its siblings; decoding as a whole cannot
/// fail.
pub fn decode(points: &[RawDataPoint], timestamp: DateTime<Utc>) -> Decoded {
    let mut out = Decoded::default();
    for point in points {
        let Some(entry) = entry_for_code(point.code) else {
            continue;
        };
        match point.value.as_i64() {
            None => out.warnings.push(DecodeWarning {
                code: point.code,
                metric: entry.metric,
                reason: DropReason::NotAnInteger,
            }),
            Some(raw) if raw < entry.min_raw || raw > entry.max_raw => {
                out.warnings.push(DecodeWarning {
                    code: point.code,
                    metric: entry.metric,
                    reason: DropReason::OutOfRange {
                        raw,
                        min: entry.min_raw,
                        max: entry.max_raw,
                    },
                })
            }
            Some(raw) => out.readings.push(Reading {
                dp: entry,
                value: raw as f64 / entry.divisor as f64,
                timestamp,
            }),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(code: u32, value: i64) -> RawDataPoint {
        RawDataPoint {
            code,
            value: json!(value),
        }
    }

    #[test]
    fn decodes_documented_scales_exactly() {
        let now = Utc::now();
        let decoded = decode(
            &[raw(8, 235), raw(106, 720), raw(111, 350), raw(126, 1025)],
            now,
        );
        assert!(decoded.warnings.is_empty());
        assert_eq!(decoded.readings.len(), 4);

        let by_metric = |metric: &str| {
            decoded
                .readings
                .iter()
                .find(|r| r.dp.metric == metric)
                .expect(metric)
        };
        let temp = by_metric("aquarium_temperature_celsius");
        assert_eq!(temp.value, 23.5);
        assert_eq!(temp.dp.unit, "°C");
        assert_eq!(by_metric("aquarium_ph").value, 7.2);
        assert_eq!(by_metric("aquarium_tds_ppm").value, 350.0);
        assert_eq!(by_metric("aquarium_specific_gravity").value, 1.025);
    }

    #[test]
    fn readings_share_the_cycle_timestamp() {
        let now = Utc::now();
        let decoded = decode(&[raw(8, 235), raw(131, -50)], now);
        assert!(decoded.readings.iter().all(|r| r.timestamp == now));
    }

    #[test]
    fn unknown_codes_are_dropped_silently() {
        let decoded = decode(&[raw(8, 235), raw(999, 1)], Utc::now());
        assert_eq!(decoded.readings.len(), 1);
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn out_of_range_point_is_dropped_with_warning() {
        let decoded = decode(&[raw(106, 1500), raw(8, 235)], Utc::now());
        assert_eq!(decoded.readings.len(), 1);
        assert_eq!(decoded.readings[0].dp.metric, "aquarium_temperature_celsius");
        assert_eq!(decoded.warnings.len(), 1);
        assert_eq!(decoded.warnings[0].metric, "aquarium_ph");
        assert!(matches!(
            decoded.warnings[0].reason,
            DropReason::OutOfRange { raw: 1500, .. }
        ));
    }

    #[test]
    fn non_integer_value_is_dropped_with_warning() {
        let points = [
            RawDataPoint {
                code: 8,
                value: json!("warming up"),
            },
            raw(111, 350),
        ];
        let decoded = decode(&points, Utc::now());
        assert_eq!(decoded.readings.len(), 1);
        assert_eq!(decoded.warnings.len(), 1);
        assert_eq!(decoded.warnings[0].reason, DropReason::NotAnInteger);
    }

    #[test]
    fn partial_dps_set_decodes_what_is_present() {
        let decoded = decode(&[raw(8, 235)], Utc::now());
        assert_eq!(decoded.readings.len(), 1);
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn negative_orp_is_in_range() {
        let decoded = decode(&[raw(131, -150)], Utc::now());
        assert_eq!(decoded.readings.len(), 1);
        assert_eq!(decoded.readings[0].value, -150.0);
    }
}
