//! Shared types for lot occupancy tracking

use serde::{Deserialize, Deserializer, Serialize};

/// Device identity: a 31-bit non-negative integer handed out at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct DeviceKey(pub u32);

impl DeviceKey {
    /// Largest key in the 31-bit space
    pub const MAX: u32 = (1 << 31) - 1;

    /// Build a key, rejecting values outside the 31-bit space
    pub fn new(raw: u32) -> Option<Self> {
        (raw <= Self::MAX).then_some(Self(raw))
    }

    /// Key from an arbitrary wire integer; None outside the 31-bit space
    pub fn from_wire(raw: i64) -> Option<Self> {
        u32::try_from(raw).ok().and_then(Self::new)
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally assigned lot identifier
///
/// The wire format accepts either a string or an integer; integers are
/// normalised to their decimal representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LotId(pub String);

impl LotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for LotId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct LotIdVisitor;

        impl<'de> Visitor<'de> for LotIdVisitor {
            type Value = LotId;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a non-empty string or integer lot id")
            }

            fn visit_str<E>(self, value: &str) -> Result<LotId, E>
            where
                E: de::Error,
            {
                if value.is_empty() {
                    return Err(E::invalid_value(de::Unexpected::Str(value), &self));
                }
                Ok(LotId(value.to_string()))
            }

            fn visit_string<E>(self, value: String) -> Result<LotId, E>
            where
                E: de::Error,
            {
                if value.is_empty() {
                    return Err(E::invalid_value(de::Unexpected::Str(&value), &self));
                }
                Ok(LotId(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<LotId, E>
            where
                E: de::Error,
            {
                Ok(LotId(value.to_string()))
            }

            fn visit_i64<E>(self, value: i64) -> Result<LotId, E>
            where
                E: de::Error,
            {
                Ok(LotId(value.to_string()))
            }
        }

        deserializer.deserialize_any(LotIdVisitor)
    }
}

/// Enter/exit counts derived from one observed motion episode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OccupancyDelta {
    pub enter: u32,
    pub exit: u32,
}

impl OccupancyDelta {
    pub const ENTER: Self = Self { enter: 1, exit: 0 };
    pub const EXIT: Self = Self { enter: 0, exit: 1 };

    #[inline]
    pub fn net(&self) -> i64 {
        i64::from(self.enter) - i64::from(self.exit)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.net() == 0
    }
}

/// One signed occupancy adjustment reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaEvent {
    pub device_key: DeviceKey,
    pub delta: OccupancyDelta,
}

impl DeltaEvent {
    pub fn new(device_key: DeviceKey, enter: u32, exit: u32) -> Self {
        Self { device_key, delta: OccupancyDelta { enter, exit } }
    }

    #[inline]
    pub fn net_delta(&self) -> i64 {
        self.delta.net()
    }
}

/// Body of `POST /register`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lot: Option<LotId>,
}

/// Reply to `POST /register`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub key: DeviceKey,
}

/// Body of `POST /report`
///
/// Missing or null counts are treated as zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub key: DeviceKey,
    #[serde(default)]
    pub enter: Option<u32>,
    #[serde(default)]
    pub exit: Option<u32>,
}

impl ReportRequest {
    pub fn into_event(self) -> DeltaEvent {
        DeltaEvent::new(self.key, self.enter.unwrap_or(0), self.exit.unwrap_or(0))
    }
}

impl From<DeltaEvent> for ReportRequest {
    fn from(event: DeltaEvent) -> Self {
        Self {
            key: event.device_key,
            enter: Some(event.delta.enter),
            exit: Some(event.delta.exit),
        }
    }
}

/// Body of `POST /assign`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub key: DeviceKey,
    pub lot: LotId,
}

/// Point-in-time view of one lot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotView {
    pub id: LotId,
    #[serde(rename = "carCount")]
    pub car_count: i64,
    pub devices: Vec<DeviceKey>,
}

/// Reply to `GET /lots`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotsResponse {
    pub lots: Vec<LotView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_key_range() {
        assert_eq!(DeviceKey::new(0), Some(DeviceKey(0)));
        assert_eq!(DeviceKey::new(DeviceKey::MAX), Some(DeviceKey(DeviceKey::MAX)));
        assert_eq!(DeviceKey::new(DeviceKey::MAX + 1), None);
    }

    #[test]
    fn test_device_key_from_wire() {
        assert_eq!(DeviceKey::from_wire(42), Some(DeviceKey(42)));
        assert_eq!(DeviceKey::from_wire(-1), None);
        assert_eq!(DeviceKey::from_wire(i64::from(DeviceKey::MAX) + 1), None);
        assert_eq!(DeviceKey::from_wire(i64::from(u32::MAX) + 1), None);
    }

    #[test]
    fn test_lot_id_accepts_string_and_integer() {
        let from_str: RegisterRequest = serde_json::from_str(r#"{"lot":"A"}"#).unwrap();
        assert_eq!(from_str.lot, Some(LotId::new("A")));

        let from_int: RegisterRequest = serde_json::from_str(r#"{"lot":7}"#).unwrap();
        assert_eq!(from_int.lot, Some(LotId::new("7")));

        let missing: RegisterRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(missing.lot, None);

        assert!(serde_json::from_str::<RegisterRequest>(r#"{"lot":""}"#).is_err());
    }

    #[test]
    fn test_report_missing_counts_default_to_zero() {
        let req: ReportRequest = serde_json::from_str(r#"{"key":5,"enter":2}"#).unwrap();
        let event = req.into_event();
        assert_eq!(event.device_key, DeviceKey(5));
        assert_eq!(event.delta, OccupancyDelta { enter: 2, exit: 0 });
        assert_eq!(event.net_delta(), 2);

        let req: ReportRequest =
            serde_json::from_str(r#"{"key":5,"enter":null,"exit":3}"#).unwrap();
        assert_eq!(req.into_event().net_delta(), -3);
    }

    #[test]
    fn test_report_rejects_negative_counts() {
        assert!(serde_json::from_str::<ReportRequest>(r#"{"key":5,"enter":-1}"#).is_err());
        assert!(serde_json::from_str::<ReportRequest>(r#"{"key":5,"exit":1.5}"#).is_err());
    }

    #[test]
    fn test_lot_view_uses_camel_case_count() {
        let view = LotView { id: LotId::new("A"), car_count: -2, devices: vec![DeviceKey(9)] };
        let json = serde_json::to_string(&view).unwrap();
        assert_eq!(json, r#"{"id":"A","carCount":-2,"devices":[9]}"#);
    }
}
