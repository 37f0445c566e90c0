//! Conversions from host payloads to device values.
//!
//! Everything here is pure; a payload outside a mode's domain yields
//! [`InvalidPayload`] and nothing is sent to the device.

use crate::error::InvalidPayload;
use serde_json::Value;

pub const DEFAULT_DEBOUNCE_US: u32 = 25;
pub const MAX_DEBOUNCE_US: u32 = 300_000;
pub const DEFAULT_FREQUENCY_HZ: u32 = 800;
pub const MIN_FREQUENCY_HZ: u32 = 5;
pub const MAX_FREQUENCY_HZ: u32 = 40_000;

/// Servo bounds in tenths of a millisecond.
const SERVO_FLOOR: f64 = 5.0;
const SERVO_CEIL: f64 = 25.0;

fn number(payload: &Value) -> Option<f64> {
    match payload {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Level for a digital output: booleans, 0/1, or one of
/// `1 0 on off true false` in any case.
pub fn digital_level(payload: &Value) -> Result<bool, InvalidPayload> {
    let level = match payload {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => Some(true),
            Some(v) if v == 0.0 => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "on" | "true" => Some(true),
            "0" | "off" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    };
    level.ok_or_else(|| InvalidPayload::new(payload))
}

fn percent(payload: &Value) -> Result<f64, InvalidPayload> {
    match number(payload) {
        Some(v) if (0.0..=100.0).contains(&v) => Ok(v),
        _ => Err(InvalidPayload::new(payload)),
    }
}

/// 8-bit duty for a PWM percentage, rounded half up.
pub fn pwm_duty(payload: &Value) -> Result<u8, InvalidPayload> {
    let pct = percent(payload)?;
    let duty = (pct * 255.0 / 100.0 + 0.5).floor();
    Ok(duty.clamp(0.0, 255.0) as u8)
}

/// Travel limits of a servo output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ServoRange {
    min: f64,
    max: f64,
}

impl Default for ServoRange {
    fn default() -> Self {
        Self {
            min: SERVO_FLOOR,
            max: SERVO_CEIL,
        }
    }
}

impl ServoRange {
    /// Build from configured bounds in hundredths (500 = 5). Bounds are
    /// swapped when given backwards, then each is clamped into `[5, 25]`.
    pub fn from_hundredths(min: Option<f64>, max: Option<f64>) -> Self {
        let mut lo = min.filter(|v| v.is_finite()).unwrap_or(500.0) / 100.0;
        let mut hi = max.filter(|v| v.is_finite()).unwrap_or(2500.0) / 100.0;
        if lo > hi {
            std::mem::swap(&mut lo, &mut hi);
        }
        Self {
            min: lo.clamp(SERVO_FLOOR, SERVO_CEIL),
            max: hi.clamp(SERVO_FLOOR, SERVO_CEIL),
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Pulse width in microseconds for a 0..=100 position. An empty
    /// payload means position 0.
    pub fn pulse_width(&self, payload: &Value) -> Result<u32, InvalidPayload> {
        let v = match payload {
            Value::Null => 0.0,
            Value::String(s) if s.is_empty() => 0.0,
            other => percent(other)?,
        };
        let r = (self.max - self.min) * 100.0;
        Ok((1500.0 - r / 2.0 + v * r / 100.0).trunc() as u32)
    }
}

/// Debounce window with the default applied and the range enforced.
pub fn clamp_debounce(us: Option<i64>) -> u32 {
    let us = us.unwrap_or(DEFAULT_DEBOUNCE_US as i64);
    us.clamp(0, MAX_DEBOUNCE_US as i64) as u32
}

pub fn clamp_frequency(hz: Option<i64>) -> u32 {
    let hz = hz.unwrap_or(DEFAULT_FREQUENCY_HZ as i64);
    hz.clamp(MIN_FREQUENCY_HZ as i64, MAX_FREQUENCY_HZ as i64) as u32
}

/// Text written to a string output or shown in a status line.
pub fn text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Sysex body from an array of 7-bit bytes.
pub fn sysex_body(payload: &Value) -> Result<Vec<u8>, InvalidPayload> {
    let Value::Array(items) = payload else {
        return Err(InvalidPayload::new(payload));
    };
    items
        .iter()
        .map(|b| match b.as_u64() {
            Some(v) if v < 0x80 => Ok(v as u8),
            _ => Err(InvalidPayload::new(payload)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digital_accepts_common_spellings() {
        for (p, want) in [
            (json!(true), true),
            (json!(0), false),
            (json!(1), true),
            (json!("ON"), true),
            (json!("off"), false),
            (json!("True"), true),
            (json!("0"), false),
        ] {
            assert_eq!(digital_level(&p).unwrap(), want, "{p}");
        }
        assert!(digital_level(&json!(2)).is_err());
        assert!(digital_level(&json!("maybe")).is_err());
        assert!(digital_level(&Value::Null).is_err());
    }

    #[test]
    fn pwm_percent_to_duty() {
        assert_eq!(pwm_duty(&json!(0)).unwrap(), 0);
        assert_eq!(pwm_duty(&json!(50)).unwrap(), 128);
        assert_eq!(pwm_duty(&json!(100)).unwrap(), 255);
        assert_eq!(pwm_duty(&json!("25")).unwrap(), 64);
        assert!(pwm_duty(&json!(101)).is_err());
        assert!(pwm_duty(&json!(-1)).is_err());
        assert!(pwm_duty(&json!("abc")).is_err());
    }

    #[test]
    fn servo_default_range() {
        let r = ServoRange::from_hundredths(Some(500.0), Some(2500.0));
        assert_eq!(r.pulse_width(&json!(0)).unwrap(), 500);
        assert_eq!(r.pulse_width(&json!(100)).unwrap(), 2500);
        assert_eq!(r.pulse_width(&json!(50)).unwrap(), 1500);
        assert_eq!(r.pulse_width(&Value::Null).unwrap(), 500);
        assert_eq!(r.pulse_width(&json!("")).unwrap(), 500);
        assert!(r.pulse_width(&json!(150)).is_err());
    }

    #[test]
    fn servo_bounds_swap_and_clamp() {
        let r = ServoRange::from_hundredths(Some(3000.0), Some(100.0));
        assert_eq!((r.min(), r.max()), (5.0, 25.0));
        let r = ServoRange::from_hundredths(Some(1000.0), Some(2000.0));
        assert_eq!(r.pulse_width(&json!(0)).unwrap(), 1000);
        assert_eq!(r.pulse_width(&json!(100)).unwrap(), 2000);
    }

    #[test]
    fn config_values_clamped() {
        assert_eq!(clamp_debounce(None), 25);
        assert_eq!(clamp_debounce(Some(-4)), 0);
        assert_eq!(clamp_debounce(Some(1_000_000)), 300_000);
        assert_eq!(clamp_frequency(None), 800);
        assert_eq!(clamp_frequency(Some(1)), 5);
        assert_eq!(clamp_frequency(Some(90_000)), 40_000);
    }

    #[test]
    fn sysex_rejects_high_bytes() {
        assert_eq!(sysex_body(&json!([1, 2, 127])).unwrap(), vec![1, 2, 127]);
        assert!(sysex_body(&json!([128])).is_err());
        assert!(sysex_body(&json!("x")).is_err());
    }
}
