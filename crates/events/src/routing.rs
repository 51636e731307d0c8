//! Routing metadata resolution (property fallback chain).
//!
//! Every lookup walks an ordered list of property names and takes the first
//! one present: the platform-specific name first, then the generic one.
//!
//! | field            | chain                                                          | default            |
//! |------------------|----------------------------------------------------------------|--------------------|
//! | device id        | `iothub-connection-device-id`, `deviceId`                      | none (drop)        |
//! | module id        | `iothub-connection-module-id`, `moduleId`                      | none (valid)       |
//! | target           | `to`, `iothub-message-schema`, synthesized from device/module  | n/a                |
//! | content type     | `iothub-content-type`, `content-type`                          | `application/json` |
//! | content encoding | `iothub-content-encoding`, `content-encoding`                  | `utf-8`            |

use std::collections::BTreeMap;

/// Well-known property names.
pub mod names {
    pub const PLATFORM_DEVICE_ID: &str = "iothub-connection-device-id";
    pub const DEVICE_ID: &str = "deviceId";

    pub const PLATFORM_MODULE_ID: &str = "iothub-connection-module-id";
    pub const MODULE_ID: &str = "moduleId";

    pub const TO: &str = "to";
    pub const PLATFORM_SCHEMA: &str = "iothub-message-schema";

    pub const PLATFORM_CONTENT_TYPE: &str = "iothub-content-type";
    pub const CONTENT_TYPE: &str = "content-type";

    pub const PLATFORM_CONTENT_ENCODING: &str = "iothub-content-encoding";
    pub const CONTENT_ENCODING: &str = "content-encoding";
}

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
pub const DEFAULT_CONTENT_ENCODING: &str = "utf-8";

const DEVICE_ID_CHAIN: [&str; 2] = [names::PLATFORM_DEVICE_ID, names::DEVICE_ID];
const MODULE_ID_CHAIN: [&str; 2] = [names::PLATFORM_MODULE_ID, names::MODULE_ID];
const TARGET_CHAIN: [&str; 2] = [names::TO, names::PLATFORM_SCHEMA];
const CONTENT_TYPE_CHAIN: [&str; 2] = [names::PLATFORM_CONTENT_TYPE, names::CONTENT_TYPE];
const CONTENT_ENCODING_CHAIN: [&str; 2] =
    [names::PLATFORM_CONTENT_ENCODING, names::CONTENT_ENCODING];

/// Routing metadata resolved from a message's properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingMetadata {
    pub device_id: String,
    pub module_id: Option<String>,
    pub target: String,
    pub content_type: String,
    pub content_encoding: String,
}

impl RoutingMetadata {
    /// Resolve metadata from merged properties.
    ///
    /// Returns `None` when no device-identifying property is present: the
    /// message did not come from a recognized producer and is filtered out.
    pub fn resolve(properties: &BTreeMap<String, String>) -> Option<Self> {
        let device_id = first_present(properties, &DEVICE_ID_CHAIN)?.to_owned();
        let module_id = first_present(properties, &MODULE_ID_CHAIN).map(str::to_owned);

        let target = match first_present(properties, &TARGET_CHAIN) {
            Some(t) => t.to_owned(),
            None => synthesize_target(&device_id, module_id.as_deref()),
        };

        let content_type = first_present(properties, &CONTENT_TYPE_CHAIN)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_owned();
        let content_encoding = first_present(properties, &CONTENT_ENCODING_CHAIN)
            .unwrap_or(DEFAULT_CONTENT_ENCODING)
            .to_owned();

        Some(Self {
            device_id,
            module_id,
            target,
            content_type,
            content_encoding,
        })
    }
}

/// Device-to-cloud topic for a device, or for a module on that device.
pub fn synthesize_target(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module_id) => format!("devices/{device_id}/modules/{module_id}/messages/events"),
        None => format!("devices/{device_id}/messages/events"),
    }
}

/// Merge application and system property namespaces; system properties win.
pub fn merge_properties(
    application: &BTreeMap<String, String>,
    system: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = application.clone();
    merged.extend(system.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn first_present<'a>(properties: &'a BTreeMap<String, String>, chain: &[&str]) -> Option<&'a str> {
    chain
        .iter()
        .find_map(|name| properties.get(*name))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_device_id_drops_message() {
        assert!(RoutingMetadata::resolve(&props(&[("to", "a/b")])).is_none());
        assert!(RoutingMetadata::resolve(&props(&[("moduleId", "m")])).is_none());
    }

    #[test]
    fn platform_device_id_wins_over_generic() {
        let meta = RoutingMetadata::resolve(&props(&[
            (names::PLATFORM_DEVICE_ID, "hub-dev"),
            (names::DEVICE_ID, "generic-dev"),
        ]))
        .unwrap();
        assert_eq!(meta.device_id, "hub-dev");
    }

    #[test]
    fn generic_ids_are_used_as_fallback() {
        let meta = RoutingMetadata::resolve(&props(&[("deviceId", "d1"), ("moduleId", "m1")]))
            .unwrap();
        assert_eq!(meta.device_id, "d1");
        assert_eq!(meta.module_id.as_deref(), Some("m1"));
    }

    #[test]
    fn target_prefers_to_then_schema_then_synthesized() {
        let with_to = RoutingMetadata::resolve(&props(&[
            ("deviceId", "d1"),
            ("to", "site/room1/temp"),
            (names::PLATFORM_SCHEMA, "schema/x"),
        ]))
        .unwrap();
        assert_eq!(with_to.target, "site/room1/temp");

        let with_schema = RoutingMetadata::resolve(&props(&[
            ("deviceId", "d1"),
            (names::PLATFORM_SCHEMA, "schema/x"),
        ]))
        .unwrap();
        assert_eq!(with_schema.target, "schema/x");

        let device_only = RoutingMetadata::resolve(&props(&[("deviceId", "d1")])).unwrap();
        assert_eq!(device_only.target, "devices/d1/messages/events");

        let module = RoutingMetadata::resolve(&props(&[("deviceId", "d1"), ("moduleId", "m1")]))
            .unwrap();
        assert_eq!(module.target, "devices/d1/modules/m1/messages/events");
    }

    #[test]
    fn content_type_and_encoding_defaults() {
        let meta = RoutingMetadata::resolve(&props(&[("deviceId", "d1")])).unwrap();
        assert_eq!(meta.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(meta.content_encoding, DEFAULT_CONTENT_ENCODING);
        assert_eq!(meta.module_id, None);
    }

    #[test]
    fn content_type_platform_then_generic() {
        let meta = RoutingMetadata::resolve(&props(&[
            ("deviceId", "d1"),
            (names::PLATFORM_CONTENT_TYPE, "application/octet-stream"),
            (names::CONTENT_TYPE, "text/plain"),
            (names::CONTENT_ENCODING, "utf-16"),
        ]))
        .unwrap();
        assert_eq!(meta.content_type, "application/octet-stream");
        assert_eq!(meta.content_encoding, "utf-16");
    }

    #[test]
    fn system_properties_win_on_merge() {
        let app = props(&[("deviceId", "spoofed"), ("custom", "1")]);
        let sys = props(&[("deviceId", "real")]);
        let merged = merge_properties(&app, &sys);
        assert_eq!(merged.get("deviceId").map(String::as_str), Some("real"));
        assert_eq!(merged.get("custom").map(String::as_str), Some("1"));
    }
}
