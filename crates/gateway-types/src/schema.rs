//! Validated JSON blobs for permissions, preferences, and launch configs
//! (§9 "Runtime-reflection / dynamic-typed blobs").
//!
//! These travel over the wire and out of the (collaborator) persistence
//! store as loosely-typed JSON. Rather than trusting that shape, each blob
//! is parsed into a tagged record that checks presence and type of
//! `enabled` on every leaf item, and rejects anything else with
//! `InvalidPermissions`.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One capability item's enablement plus free-form metadata (descriptions,
/// danger levels, …) that is *not* considered for "enabled-membership"
/// equality (§4.5 `comparePermissions`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityItem {
    pub enabled: bool,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, Value>,
}

/// Per-server capability mask: which tools/resources/prompts are enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilityMask {
    #[serde(default)]
    pub tools: BTreeMap<String, CapabilityItem>,
    #[serde(default)]
    pub resources: BTreeMap<String, CapabilityItem>,
    #[serde(default)]
    pub prompts: BTreeMap<String, CapabilityItem>,
}

/// Admin-assigned permissions: `serverId -> ServerCapabilityMask`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionsBlob(pub BTreeMap<String, ServerCapabilityMask>);

/// User preference overlay: only the `enabled` booleans on *existing*
/// items are honored; unknown items are ignored (§4.5 step 3), so this
/// reuses the same shape as `PermissionsBlob`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferencesBlob(pub BTreeMap<String, ServerCapabilityMask>);

/// Encrypted per-user server launch configuration. The gateway core never
/// decrypts these; it only tracks presence (`configured` in §4.5) and
/// passes the ciphertext to the (collaborator) auth-strategy layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfigsBlob(pub BTreeMap<String, EncryptedBlob>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub ciphertext: String,
    #[serde(default)]
    pub nonce: Option<String>,
}

fn validate_capability_map(
    value: &Value,
    path: &str,
) -> Result<BTreeMap<String, CapabilityItem>, GatewayError> {
    let Value::Object(obj) = value else {
        return Err(GatewayError::InvalidPermissions(format!(
            "{path} must be an object"
        )));
    };
    let mut out = BTreeMap::new();
    for (name, item) in obj {
        let Value::Object(item_obj) = item else {
            return Err(GatewayError::InvalidPermissions(format!(
                "{path}.{name} must be an object"
            )));
        };
        let enabled = match item_obj.get("enabled") {
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(GatewayError::InvalidPermissions(format!(
                    "{path}.{name}.enabled must be a boolean"
                )));
            }
            None => {
                return Err(GatewayError::InvalidPermissions(format!(
                    "{path}.{name} is missing required field `enabled`"
                )));
            }
        };
        let mut metadata = BTreeMap::new();
        for (k, v) in item_obj {
            if k != "enabled" {
                metadata.insert(k.clone(), v.clone());
            }
        }
        out.insert(name.clone(), CapabilityItem { enabled, metadata });
    }
    Ok(out)
}

fn validate_server_mask(value: &Value, path: &str) -> Result<ServerCapabilityMask, GatewayError> {
    let Value::Object(obj) = value else {
        return Err(GatewayError::InvalidPermissions(format!(
            "{path} must be an object"
        )));
    };
    let empty = Value::Object(serde_json::Map::new());
    Ok(ServerCapabilityMask {
        tools: validate_capability_map(obj.get("tools").unwrap_or(&empty), &format!("{path}.tools"))?,
        resources: validate_capability_map(
            obj.get("resources").unwrap_or(&empty),
            &format!("{path}.resources"),
        )?,
        prompts: validate_capability_map(
            obj.get("prompts").unwrap_or(&empty),
            &format!("{path}.prompts"),
        )?,
    })
}

impl PermissionsBlob {
    /// Parses and structurally validates a raw permissions blob (§4.1
    /// "parses and structurally validates the permissions blob").
    pub fn parse(value: &Value) -> Result<Self, GatewayError> {
        let Value::Object(obj) = value else {
            return Err(GatewayError::InvalidPermissions(
                "permissions must be an object keyed by serverId".into(),
            ));
        };
        let mut out = BTreeMap::new();
        for (server_id, mask) in obj {
            out.insert(
                server_id.clone(),
                validate_server_mask(mask, &format!("permissions.{server_id}"))?,
            );
        }
        Ok(Self(out))
    }
}

impl PreferencesBlob {
    pub fn parse(value: &Value) -> Result<Self, GatewayError> {
        let Value::Object(obj) = value else {
            return Err(GatewayError::InvalidPermissions(
                "preferences must be an object keyed by serverId".into(),
            ));
        };
        let mut out = BTreeMap::new();
        for (server_id, mask) in obj {
            out.insert(
                server_id.clone(),
                validate_server_mask(mask, &format!("preferences.{server_id}"))?,
            );
        }
        Ok(Self(out))
    }
}

/// Enabled-membership-only view of a capability map: compares which names
/// are enabled, ignoring descriptions/danger-levels/any other metadata.
/// This is exactly the comparison `comparePermissions` (§4.5) needs.
#[must_use]
pub fn enabled_names(map: &BTreeMap<String, CapabilityItem>) -> std::collections::BTreeSet<&str> {
    map.iter()
        .filter(|(_, item)| item.enabled)
        .map(|(name, _)| name.as_str())
        .collect()
}
