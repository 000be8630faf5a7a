use std::fmt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Trade direction. Decoding is case-insensitive; values outside the four
/// standard directions are kept, uppercased, in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalAction {
    Buy,
    Sell,
    Short,
    Cover,
    Other(String),
}

impl SignalAction {
    pub fn as_str(&self) -> &str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Short => "SHORT",
            SignalAction::Cover => "COVER",
            SignalAction::Other(other) => other,
        }
    }
}

impl From<&str> for SignalAction {
    fn from(value: &str) -> Self {
        let normalized = value.trim().to_uppercase();
        match normalized.as_str() {
            "BUY" => SignalAction::Buy,
            "SELL" => SignalAction::Sell,
            "SHORT" => SignalAction::Short,
            "COVER" => SignalAction::Cover,
            _ => SignalAction::Other(normalized),
        }
    }
}

impl From<String> for SignalAction {
    fn from(value: String) -> Self {
        SignalAction::from(value.as_str())
    }
}

impl From<SignalAction> for String {
    fn from(action: SignalAction) -> Self {
        match action {
            SignalAction::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trade intent broadcast to every subscriber.
///
/// Decoding accepts any JSON object. Known fields are read leniently (action
/// in any case, numbers given as strings, whole-number floats as volume);
/// a known field whose value cannot be read that way stays in `extensions`
/// untouched, as does every field this type does not know about. Unset
/// optional fields are left out of the encoded frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "Map<String, Value>")]
pub struct Signal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<SignalAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Signal {
    pub fn new(action: SignalAction, symbol: impl Into<String>) -> Self {
        Self {
            action: Some(action),
            symbol: Some(symbol.into()),
            price: None,
            volume: None,
            strategy_id: None,
            signal_id: None,
            timestamp: None,
            extensions: Map::new(),
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_volume(mut self, volume: u64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_strategy_id(mut self, strategy_id: impl Into<String>) -> Self {
        self.strategy_id = Some(strategy_id.into());
        self
    }

    pub fn with_signal_id(mut self, signal_id: impl Into<String>) -> Self {
        self.signal_id = Some(signal_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Stamps the signal with the local wall clock, `YYYY-mm-dd HH:MM:SS`.
    pub fn stamped_now(self) -> Self {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.with_timestamp(now)
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes any JSON object. Fails only for text that is not a JSON object.
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl From<Map<String, Value>> for Signal {
    fn from(mut fields: Map<String, Value>) -> Self {
        Self {
            action: take_field(&mut fields, "action", read_action),
            symbol: take_field(&mut fields, "symbol", read_text),
            price: take_field(&mut fields, "price", read_price),
            volume: take_field(&mut fields, "volume", read_volume),
            strategy_id: take_field(&mut fields, "strategy_id", read_text),
            signal_id: take_field(&mut fields, "signal_id", read_text),
            timestamp: take_field(&mut fields, "timestamp", read_text),
            extensions: fields,
        }
    }
}

/// Removes `key` from `fields` if it is null or `read` accepts it.
fn take_field<T>(fields: &mut Map<String, Value>, key: &str, read: fn(&Value) -> Option<T>) -> Option<T> {
    let value = fields.get(key)?;
    if value.is_null() {
        fields.remove(key);
        return None;
    }
    let parsed = read(value)?;
    fields.remove(key);
    Some(parsed)
}

fn read_action(value: &Value) -> Option<SignalAction> {
    value.as_str().filter(|s| !s.trim().is_empty()).map(SignalAction::from)
}

fn read_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn read_price(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    price.filter(|p| p.is_finite())
}

fn read_volume(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|v| *v >= 0.0 && v.fract() == 0.0 && *v <= u64::MAX as f64)
                .map(|v| v as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Some(action) => write!(f, "{}", action)?,
            None => f.write_str("?")?,
        }
        write!(f, " {}", self.symbol.as_deref().unwrap_or("?"))?;
        if let Some(volume) = self.volume {
            write!(f, " x{}", volume)?;
        }
        if let Some(price) = self.price {
            write!(f, " @ {}", price)?;
        }
        Ok(())
    }
}

/// Identification payload a client sends as its first frame. Every field is
/// optional: the server never requires it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ClientIdentity {
    pub fn new(
        client_id: impl Into<String>,
        client_type: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            client_id: Some(client_id.into()),
            client_type: Some(client_type.into()),
            version: Some(version.into()),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// True when none of the identification fields is present.
    pub fn is_empty(&self) -> bool {
        self.client_id.is_none() && self.client_type.is_none() && self.version.is_none()
    }

    pub fn describe(&self) -> String {
        format!(
            "{} ({} v{})",
            self.client_id.as_deref().unwrap_or("anonymous"),
            self.client_type.as_deref().unwrap_or("unknown"),
            self.version.as_deref().unwrap_or("?"),
        )
    }
}
