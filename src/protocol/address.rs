//! Structured addressing for device- and application-scoped message streams
//!
//! Addresses identify a stream of uplinks, downlinks, or events for one
//! device or one application. The same grammar is rendered in two dialects:
//! the queue/exchange broker uses `.`-separated routing keys with `*` as the
//! single-level wildcard, the lightweight pub/sub broker uses `/`-separated
//! topics with `+`. Both use `#` as the multi-level wildcard. Empty scope or
//! device components format as wildcards and parse back to `None`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier pattern shared by application and device IDs: lowercase
/// alphanumeric with single internal `-`/`_` separators, 2-36 characters.
static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-z](?:[_-]?[0-9a-z]){1,35}$").unwrap());

/// Event field segment pattern (the subtype after `events`).
static FIELD_SEGMENT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-z_-]+$").unwrap());

/// Event field for device activations.
pub const ACTIVATIONS_FIELD: &str = "activations";

/// Literal segment separating the application scope from the device ID.
const DEVICES_SEGMENT: &str = "devices";

/// Literal kind segment for event addresses.
const EVENTS_SEGMENT: &str = "events";

/// Multi-level wildcard, identical in both dialects.
pub const MULTI_WILDCARD: &str = "#";

/// Address grammar rendering: separator and single-level wildcard token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Queue/exchange routing keys: `appid.devices.devid.up`, wildcard `*`.
    Amqp,
    /// Pub/sub topics: `appid/devices/devid/up`, wildcard `+`.
    Mqtt,
}

impl Dialect {
    pub fn separator(&self) -> char {
        match self {
            Dialect::Amqp => '.',
            Dialect::Mqtt => '/',
        }
    }

    pub fn single_wildcard(&self) -> &'static str {
        match self {
            Dialect::Amqp => "*",
            Dialect::Mqtt => "+",
        }
    }
}

/// Message kind carried in a device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Events,
    Up,
    Down,
}

impl AddressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressKind::Events => "events",
            AddressKind::Up => "up",
            AddressKind::Down => "down",
        }
    }

    fn from_segment(segment: &str) -> Result<Self, AddressError> {
        match segment {
            "events" => Ok(AddressKind::Events),
            "up" => Ok(AddressKind::Up),
            "down" => Ok(AddressKind::Down),
            other => Err(AddressError::UnknownKind(other.to_string())),
        }
    }
}

/// Structured errors for address parsing and construction.
///
/// Parsing is total: a malformed input is rejected as a whole, never
/// partially matched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid identifier {0:?}")]
    InvalidId(String),

    #[error("expected literal segment {expected:?}, found {found:?}")]
    UnexpectedLiteral {
        expected: &'static str,
        found: String,
    },

    #[error("unknown message kind {0:?}")]
    UnknownKind(String),

    #[error("invalid event field {0:?}")]
    InvalidField(String),

    #[error("field is only valid on event addresses")]
    UnexpectedField,

    #[error("malformed address {0:?}")]
    Malformed(String),
}

fn validate_id(id: &str) -> Result<(), AddressError> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(AddressError::InvalidId(id.to_string()))
    }
}

fn parse_id(segment: &str, dialect: Dialect) -> Result<Option<String>, AddressError> {
    if segment == dialect.single_wildcard() {
        return Ok(None);
    }
    validate_id(segment)?;
    Ok(Some(segment.to_string()))
}

/// Validates an event field: either the multi-level wildcard alone or one or
/// more separator-joined segments. Fields are stored canonically with `.`
/// joining segments and re-rendered per dialect on format.
fn validate_field(field: &str) -> Result<(), AddressError> {
    if field == MULTI_WILDCARD {
        return Ok(());
    }
    if field.is_empty() {
        return Err(AddressError::InvalidField(field.to_string()));
    }
    for segment in field.split('.') {
        if !FIELD_SEGMENT_PATTERN.is_match(segment) {
            return Err(AddressError::InvalidField(field.to_string()));
        }
    }
    Ok(())
}

fn parse_field_segments(segments: &[&str]) -> Result<String, AddressError> {
    let field = segments.join(".");
    validate_field(&field)?;
    Ok(field)
}

fn push_field(parts: &mut Vec<String>, field: &str) {
    for segment in field.split('.') {
        parts.push(segment.to_string());
    }
}

/// Address of a device-scoped message stream.
///
/// Wire form: `<app|wild>.devices.<dev|wild>.<kind>[.<field>]`. The field is
/// only meaningful for `kind == Events` and names an event subtype such as
/// `activations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub app_id: Option<String>,
    pub dev_id: Option<String>,
    pub kind: AddressKind,
    pub field: Option<String>,
}

impl DeviceAddress {
    /// Builds a validated device address. `None` components format as
    /// wildcards.
    pub fn new(
        app_id: Option<&str>,
        dev_id: Option<&str>,
        kind: AddressKind,
        field: Option<&str>,
    ) -> Result<Self, AddressError> {
        if let Some(id) = app_id {
            validate_id(id)?;
        }
        if let Some(id) = dev_id {
            validate_id(id)?;
        }
        if let Some(field) = field {
            if kind != AddressKind::Events {
                return Err(AddressError::UnexpectedField);
            }
            validate_field(field)?;
        }
        Ok(DeviceAddress {
            app_id: app_id.map(str::to_string),
            dev_id: dev_id.map(str::to_string),
            kind,
            field: field.map(str::to_string),
        })
    }

    pub fn uplink(app_id: Option<&str>, dev_id: Option<&str>) -> Result<Self, AddressError> {
        Self::new(app_id, dev_id, AddressKind::Up, None)
    }

    pub fn downlink(app_id: Option<&str>, dev_id: Option<&str>) -> Result<Self, AddressError> {
        Self::new(app_id, dev_id, AddressKind::Down, None)
    }

    pub fn activations(app_id: Option<&str>, dev_id: Option<&str>) -> Result<Self, AddressError> {
        Self::new(app_id, dev_id, AddressKind::Events, Some(ACTIVATIONS_FIELD))
    }

    /// Renders the address in the given dialect, substituting wildcards for
    /// empty components.
    pub fn format(&self, dialect: Dialect) -> String {
        let wildcard = dialect.single_wildcard();
        let mut parts = vec![
            self.app_id.clone().unwrap_or_else(|| wildcard.to_string()),
            DEVICES_SEGMENT.to_string(),
            self.dev_id.clone().unwrap_or_else(|| wildcard.to_string()),
            self.kind.as_str().to_string(),
        ];
        if let Some(field) = &self.field {
            push_field(&mut parts, field);
        }
        parts.join(&dialect.separator().to_string())
    }

    /// Parses a routing key/topic into a device address. Anchored: the
    /// `devices` literal, identifier constraints, and the kind token must all
    /// match exactly or the whole input is rejected.
    pub fn parse(input: &str, dialect: Dialect) -> Result<Self, AddressError> {
        let segments: Vec<&str> = input.split(dialect.separator()).collect();
        if segments.len() < 4 {
            return Err(AddressError::Malformed(input.to_string()));
        }
        if segments[1] != DEVICES_SEGMENT {
            return Err(AddressError::UnexpectedLiteral {
                expected: DEVICES_SEGMENT,
                found: segments[1].to_string(),
            });
        }
        let app_id = parse_id(segments[0], dialect)?;
        let dev_id = parse_id(segments[2], dialect)?;
        let kind = AddressKind::from_segment(segments[3])?;
        let field = if segments.len() > 4 {
            if kind != AddressKind::Events {
                return Err(AddressError::UnexpectedField);
            }
            Some(parse_field_segments(&segments[4..])?)
        } else {
            None
        };
        Ok(DeviceAddress {
            app_id,
            dev_id,
            kind,
            field,
        })
    }
}

/// Address of an application-scoped event stream.
///
/// Wire form: `<app|wild>.events[.<field>]`. An empty field formats as the
/// multi-level wildcard and parses back to `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationAddress {
    pub app_id: Option<String>,
    pub field: Option<String>,
}

impl ApplicationAddress {
    pub fn new(app_id: Option<&str>, field: Option<&str>) -> Result<Self, AddressError> {
        if let Some(id) = app_id {
            validate_id(id)?;
        }
        if let Some(field) = field {
            validate_field(field)?;
        }
        Ok(ApplicationAddress {
            app_id: app_id.map(str::to_string),
            field: field.map(str::to_string),
        })
    }

    pub fn format(&self, dialect: Dialect) -> String {
        let wildcard = dialect.single_wildcard();
        let mut parts = vec![
            self.app_id.clone().unwrap_or_else(|| wildcard.to_string()),
            EVENTS_SEGMENT.to_string(),
        ];
        match &self.field {
            Some(field) => push_field(&mut parts, field),
            None => parts.push(MULTI_WILDCARD.to_string()),
        }
        parts.join(&dialect.separator().to_string())
    }

    pub fn parse(input: &str, dialect: Dialect) -> Result<Self, AddressError> {
        let segments: Vec<&str> = input.split(dialect.separator()).collect();
        if segments.len() < 3 {
            return Err(AddressError::Malformed(input.to_string()));
        }
        if segments[1] != EVENTS_SEGMENT {
            return Err(AddressError::UnexpectedLiteral {
                expected: EVENTS_SEGMENT,
                found: segments[1].to_string(),
            });
        }
        let app_id = parse_id(segments[0], dialect)?;
        let field = parse_field_segments(&segments[2..])?;
        let field = if field == MULTI_WILDCARD {
            None
        } else {
            Some(field)
        };
        Ok(ApplicationAddress { app_id, field })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_device_address_format_amqp() {
        let addr = DeviceAddress::uplink(Some("appid-1"), Some("devid-1")).unwrap();
        assert_eq!(addr.format(Dialect::Amqp), "appid-1.devices.devid-1.up");
        assert_eq!(addr.format(Dialect::Mqtt), "appid-1/devices/devid-1/up");
    }

    #[test]
    fn test_device_address_wildcards() {
        let addr =
            DeviceAddress::new(None, None, AddressKind::Events, Some(ACTIVATIONS_FIELD)).unwrap();
        assert_eq!(addr.format(Dialect::Amqp), "*.devices.*.events.activations");
        assert_eq!(addr.format(Dialect::Mqtt), "+/devices/+/events/activations");
    }

    #[test]
    fn test_application_address_defaults_to_multi_wildcard() {
        let addr = ApplicationAddress::new(Some("appid"), None).unwrap();
        assert_eq!(addr.format(Dialect::Amqp), "appid.events.#");
        assert_eq!(addr.format(Dialect::Mqtt), "appid/events/#");
    }

    #[test]
    fn test_canonical_round_trips() {
        let amqp_examples = [
            "appid-1.devices.devid-1.up",
            "appid-1.devices.devid-1.down",
            "*.devices.*.events.activations",
            "appid-1.devices.*.events.down.scheduled",
        ];
        for example in amqp_examples {
            let parsed = DeviceAddress::parse(example, Dialect::Amqp).unwrap();
            assert_eq!(parsed.format(Dialect::Amqp), example, "round trip {example}");
        }

        let mqtt_examples = ["+/devices/+/up", "appid-1/devices/devid-1/events/activations"];
        for example in mqtt_examples {
            let parsed = DeviceAddress::parse(example, Dialect::Mqtt).unwrap();
            assert_eq!(parsed.format(Dialect::Mqtt), example, "round trip {example}");
        }

        let app_examples = ["appid.events.#", "appid.events.create"];
        for example in app_examples {
            let parsed = ApplicationAddress::parse(example, Dialect::Amqp).unwrap();
            assert_eq!(parsed.format(Dialect::Amqp), example, "round trip {example}");
        }
    }

    #[test]
    fn test_parse_recovers_concrete_ids_under_wildcards() {
        let parsed = DeviceAddress::parse("app.devices.test.up", Dialect::Amqp).unwrap();
        assert_eq!(parsed.app_id.as_deref(), Some("app"));
        assert_eq!(parsed.dev_id.as_deref(), Some("test"));
        assert_eq!(parsed.kind, AddressKind::Up);
    }

    #[test]
    fn test_reject_malformed_inputs() {
        // Invalid identifier (uppercase and colon)
        assert!(matches!(
            DeviceAddress::parse("appid:Invalid.devices.dev.up", Dialect::Amqp),
            Err(AddressError::InvalidId(_))
        ));
        // Wrong literal segment
        assert!(matches!(
            DeviceAddress::parse("appid-1.fridges.devid-1.up", Dialect::Amqp),
            Err(AddressError::UnexpectedLiteral { .. })
        ));
        // Unknown kind
        assert!(matches!(
            DeviceAddress::parse("appid-1.devices.devid-1.emotions", Dialect::Amqp),
            Err(AddressError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_reject_field_on_non_event_kinds() {
        assert!(matches!(
            DeviceAddress::parse("appid-1.devices.devid-1.up.extra", Dialect::Amqp),
            Err(AddressError::UnexpectedField)
        ));
        assert!(matches!(
            DeviceAddress::new(Some("appid-1"), None, AddressKind::Down, Some("x")),
            Err(AddressError::UnexpectedField)
        ));
    }

    #[test]
    fn test_reject_short_inputs() {
        assert!(DeviceAddress::parse("appid-1.devices", Dialect::Amqp).is_err());
        assert!(ApplicationAddress::parse("appid-1", Dialect::Amqp).is_err());
        assert!(ApplicationAddress::parse("appid-1.events", Dialect::Amqp).is_err());
    }

    #[test]
    fn test_identifier_constraints() {
        assert!(validate_id("appid-1").is_ok());
        assert!(validate_id("app_1-x").is_ok());
        assert!(validate_id("ab").is_ok());
        // Too short, double separators, leading separator, uppercase
        assert!(validate_id("a").is_err());
        assert!(validate_id("app--id").is_err());
        assert!(validate_id("-appid").is_err());
        assert!(validate_id("Appid").is_err());
        assert!(validate_id(&"a".repeat(37)).is_err());
    }

    #[test]
    fn test_event_field_segments() {
        let addr = DeviceAddress::new(
            Some("appid-1"),
            Some("devid-1"),
            AddressKind::Events,
            Some("down.scheduled"),
        )
        .unwrap();
        assert_eq!(
            addr.format(Dialect::Mqtt),
            "appid-1/devices/devid-1/events/down/scheduled"
        );
        let parsed = DeviceAddress::parse(
            "appid-1/devices/devid-1/events/down/scheduled",
            Dialect::Mqtt,
        )
        .unwrap();
        assert_eq!(parsed.field.as_deref(), Some("down.scheduled"));
    }

    fn id_strategy() -> impl Strategy<Value = String> {
        "[0-9a-z]{2,12}".prop_map(|s| s)
    }

    proptest! {
        #[test]
        fn device_address_round_trip(
            app in proptest::option::of(id_strategy()),
            dev in proptest::option::of(id_strategy()),
            kind_idx in 0usize..3,
            field in proptest::option::of("[0-9a-z]{1,8}"),
        ) {
            let kind = [AddressKind::Events, AddressKind::Up, AddressKind::Down][kind_idx];
            let field = if kind == AddressKind::Events { field } else { None };
            let addr = DeviceAddress::new(
                app.as_deref(),
                dev.as_deref(),
                kind,
                field.as_deref(),
            ).unwrap();
            for dialect in [Dialect::Amqp, Dialect::Mqtt] {
                let rendered = addr.format(dialect);
                let parsed = DeviceAddress::parse(&rendered, dialect).unwrap();
                prop_assert_eq!(&parsed, &addr);
                prop_assert_eq!(parsed.format(dialect), rendered);
            }
        }

        #[test]
        fn application_address_round_trip(
            app in proptest::option::of(id_strategy()),
            field in proptest::option::of("[0-9a-z]{1,8}"),
        ) {
            let addr = ApplicationAddress::new(app.as_deref(), field.as_deref()).unwrap();
            for dialect in [Dialect::Amqp, Dialect::Mqtt] {
                let rendered = addr.format(dialect);
                let parsed = ApplicationAddress::parse(&rendered, dialect).unwrap();
                prop_assert_eq!(&parsed, &addr);
                prop_assert_eq!(parsed.format(dialect), rendered);
            }
        }
    }
}
