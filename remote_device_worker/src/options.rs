// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! JSON device option parsing.

use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

/// Option keys consumed by the launcher and the proxy; the worker strips
/// them before the options reach a device factory.
const RESERVED_KEYS: &[&str] = &[
    "rid",
    "socket",
    "remote",
    "command",
    "exec",
    "remote-device",
    "bus",
    "addr",
];

#[derive(Debug, Error)]
pub(crate) enum OptionsError {
    #[error("malformed json")]
    Json(#[source] serde_json::Error),
    #[error("device options must be a json object")]
    NotAnObject,
    #[error("missing \"driver\" key")]
    MissingDriver,
    #[error("missing \"id\" key")]
    MissingId,
}

/// Parsed device creation options.
pub(crate) struct DeviceOptions {
    /// Factory to construct the device with.
    pub driver: String,
    /// Logical device name, used later for removal. Falls back to the
    /// driver name when the options carry no `id`.
    pub name: String,
    /// Remaining options, reserved keys stripped.
    pub options: Map<String, Value>,
}

fn parse_object(json: &[u8]) -> Result<Map<String, Value>, OptionsError> {
    // Tolerate a trailing NUL from C-string senders.
    let json = json.strip_suffix(&[0]).unwrap_or(json);
    match serde_json::from_slice(json).map_err(OptionsError::Json)? {
        Value::Object(map) => Ok(map),
        _ => Err(OptionsError::NotAnObject),
    }
}

/// Parses a DEV_OPTS / DEVICE_ADD payload.
pub(crate) fn parse_device_options(json: &[u8]) -> Result<DeviceOptions, OptionsError> {
    let mut map = parse_object(json)?;
    for key in RESERVED_KEYS {
        map.remove(*key);
    }
    let driver = map
        .get("driver")
        .and_then(|v| v.as_str())
        .ok_or(OptionsError::MissingDriver)?
        .to_string();
    let name = map
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or(&driver)
        .to_string();
    Ok(DeviceOptions {
        driver,
        name,
        options: map,
    })
}

/// Parses a DEVICE_DEL payload, returning the logical device name.
pub(crate) fn parse_del_options(json: &[u8]) -> Result<String, OptionsError> {
    let map = parse_object(json)?;
    map.get("id")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or(OptionsError::MissingId)
}
