use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SecondsFormat, Utc};
use uuid::Uuid;

/// EDM primitive and structured type tags (`Edm.*` plus namespace-qualified
/// enum/complex types).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdmType {
    Boolean,
    Int32,
    Int64,
    Single,
    Double,
    Decimal,
    String,
    Guid,
    Date,
    TimeOfDay,
    DateTimeOffset,
    Duration,
    Binary,
    Stream,
    /// Namespace-qualified enum type.
    Enum(String),
    /// Namespace-qualified complex type.
    Complex(String),
    Collection(Box<EdmType>),
}

impl EdmType {
    /// The CSDL type name, e.g. `Edm.Int32` or `Collection(Edm.String)`.
    pub fn name(&self) -> String {
        match self {
            EdmType::Boolean => "Edm.Boolean".into(),
            EdmType::Int32 => "Edm.Int32".into(),
            EdmType::Int64 => "Edm.Int64".into(),
            EdmType::Single => "Edm.Single".into(),
            EdmType::Double => "Edm.Double".into(),
            EdmType::Decimal => "Edm.Decimal".into(),
            EdmType::String => "Edm.String".into(),
            EdmType::Guid => "Edm.Guid".into(),
            EdmType::Date => "Edm.Date".into(),
            EdmType::TimeOfDay => "Edm.TimeOfDay".into(),
            EdmType::DateTimeOffset => "Edm.DateTimeOffset".into(),
            EdmType::Duration => "Edm.Duration".into(),
            EdmType::Binary => "Edm.Binary".into(),
            EdmType::Stream => "Edm.Stream".into(),
            EdmType::Enum(n) | EdmType::Complex(n) => n.clone(),
            EdmType::Collection(inner) => format!("Collection({})", inner.name()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            EdmType::Int32 | EdmType::Int64 | EdmType::Single | EdmType::Double | EdmType::Decimal
        )
    }
}

impl fmt::Display for EdmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A language-neutral EDM value as it flows between the parser, the store
/// and the serializer. Integral types share one representation; the declared
/// `EdmType` on the property decides the wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Double(f64),
    String(String),
    Guid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(DateTime<FixedOffset>),
    /// Signed duration in whole microseconds.
    Duration(i64),
    Binary(Vec<u8>),
    Collection(Vec<Value>),
    Complex(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Order two values of compatible kinds. Mixed Int/Double compare
    /// numerically; incompatible kinds return None.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Guid(a), Value::Guid(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Render the value as an OData URL key literal: numbers bare, strings
    /// single-quoted with `''` escaping, GUIDs bare.
    pub fn key_literal(&self) -> String {
        match self {
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Guid(g) => g.to_string(),
            other => other.raw_text(),
        }
    }

    /// Plain textual form without quoting (used by `$value` and ETags).
    pub fn raw_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Double(d) => format_double(*d),
            Value::String(s) => s.clone(),
            Value::Guid(g) => g.to_string(),
            Value::Date(d) => d.to_string(),
            Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Value::DateTime(dt) => dt
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Value::Duration(us) => format_duration(*us),
            Value::Binary(b) => b.iter().map(|x| format!("{x:02x}")).collect(),
            Value::Collection(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.raw_text()).collect();
                format!("[{}]", parts.join(","))
            }
            Value::Complex(_) => self.to_json().to_string(),
        }
    }

    /// JSON wire representation.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(_)
            | Value::Guid(_)
            | Value::Date(_)
            | Value::Time(_)
            | Value::DateTime(_)
            | Value::Duration(_)
            | Value::Binary(_) => serde_json::Value::String(self.raw_text()),
            Value::Collection(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            Value::Complex(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Coerce a JSON body value into an EDM value for the given declared
    /// type. Returns an error string naming the mismatch.
    pub fn from_json(json: &serde_json::Value, ty: &EdmType) -> Result<Value, String> {
        match (ty, json) {
            (_, serde_json::Value::Null) => Ok(Value::Null),
            (EdmType::Boolean, serde_json::Value::Bool(b)) => Ok(Value::Boolean(*b)),
            (EdmType::Int32, serde_json::Value::Number(n)) => {
                let i = n.as_i64().ok_or("expected an integer")?;
                i32::try_from(i).map_err(|_| "value out of Edm.Int32 range".to_string())?;
                Ok(Value::Int(i))
            }
            (EdmType::Int64, serde_json::Value::Number(n)) => {
                Ok(Value::Int(n.as_i64().ok_or("expected an integer")?))
            }
            (EdmType::Single | EdmType::Double | EdmType::Decimal, serde_json::Value::Number(n)) => {
                Ok(Value::Double(n.as_f64().ok_or("expected a number")?))
            }
            (EdmType::String, serde_json::Value::String(s)) => Ok(Value::String(s.clone())),
            (EdmType::Guid, serde_json::Value::String(s)) => s
                .parse::<Uuid>()
                .map(Value::Guid)
                .map_err(|_| format!("invalid Edm.Guid literal: {s}")),
            (EdmType::Date, serde_json::Value::String(s)) => s
                .parse::<NaiveDate>()
                .map(Value::Date)
                .map_err(|_| format!("invalid Edm.Date literal: {s}")),
            (EdmType::TimeOfDay, serde_json::Value::String(s)) => {
                NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                    .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
                    .map(Value::Time)
                    .map_err(|_| format!("invalid Edm.TimeOfDay literal: {s}"))
            }
            (EdmType::DateTimeOffset, serde_json::Value::String(s)) => {
                DateTime::parse_from_rfc3339(s)
                    .map(Value::DateTime)
                    .map_err(|_| format!("invalid Edm.DateTimeOffset literal: {s}"))
            }
            (EdmType::Duration, serde_json::Value::String(s)) => parse_duration(s)
                .map(Value::Duration)
                .ok_or_else(|| format!("invalid Edm.Duration literal: {s}")),
            (EdmType::Binary, serde_json::Value::String(s)) => {
                parse_hex(s).map(Value::Binary).ok_or_else(|| {
                    format!("invalid Edm.Binary literal (expected hex): {s}")
                })
            }
            (EdmType::Stream, _) => Err("stream properties are written via $value".into()),
            (EdmType::Enum(_), serde_json::Value::String(s)) => Ok(Value::String(s.clone())),
            (EdmType::Collection(inner), serde_json::Value::Array(items)) => items
                .iter()
                .map(|v| Value::from_json(v, inner))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Collection),
            (EdmType::Complex(_), serde_json::Value::Object(map)) => {
                // Complex fields keep their JSON shape; typed coercion happens
                // against the complex type's declared properties at write time.
                let mut fields = BTreeMap::new();
                for (k, v) in map {
                    fields.insert(k.clone(), json_to_untyped(v));
                }
                Ok(Value::Complex(fields))
            }
            (ty, other) => Err(format!("cannot convert {other} to {ty}")),
        }
    }
}

/// Best-effort conversion of arbitrary JSON into a Value without a declared
/// EDM type (complex payloads, action parameters).
pub fn json_to_untyped(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Collection(items.iter().map(json_to_untyped).collect())
        }
        serde_json::Value::Object(map) => Value::Complex(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_untyped(v)))
                .collect(),
        ),
    }
}

fn format_double(d: f64) -> String {
    if d == d.trunc() && d.abs() < 1e15 {
        format!("{d:.1}")
    } else {
        d.to_string()
    }
}

/// Format microseconds as an ISO 8601 duration (`P1DT2H3M4.5S` shape).
pub fn format_duration(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let mut rest = micros.unsigned_abs();
    let day_us = 86_400_000_000u64;
    let days = rest / day_us;
    rest %= day_us;
    let hours = rest / 3_600_000_000;
    rest %= 3_600_000_000;
    let minutes = rest / 60_000_000;
    rest %= 60_000_000;
    let secs = rest as f64 / 1_000_000.0;
    let mut out = format!("{sign}P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours > 0 || minutes > 0 || secs > 0.0 || days == 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if secs > 0.0 || (days == 0 && hours == 0 && minutes == 0) {
            if secs == secs.trunc() {
                out.push_str(&format!("{}S", secs as u64));
            } else {
                out.push_str(&format!("{secs}S"));
            }
        }
    }
    out
}

/// Parse an ISO 8601 duration into whole microseconds.
pub fn parse_duration(input: &str) -> Option<i64> {
    let (sign, rest) = match input.strip_prefix('-') {
        Some(r) => (-1i64, r),
        None => (1, input),
    };
    let rest = rest.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };
    let mut total = 0f64;
    let mut num = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
        } else {
            let n: f64 = num.parse().ok()?;
            num.clear();
            total += match c {
                'Y' => n * 365.0 * 86_400.0,
                'M' => n * 30.0 * 86_400.0,
                'W' => n * 7.0 * 86_400.0,
                'D' => n * 86_400.0,
                _ => return None,
            };
        }
    }
    if !num.is_empty() {
        return None;
    }
    for c in time_part.chars() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
        } else {
            let n: f64 = num.parse().ok()?;
            num.clear();
            total += match c {
                'H' => n * 3_600.0,
                'M' => n * 60.0,
                'S' => n,
                _ => return None,
            };
        }
    }
    if !num.is_empty() {
        return None;
    }
    Some(sign * (total * 1_000_000.0).round() as i64)
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
