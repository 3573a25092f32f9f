//! Capability Service (§4.5): computes a user's effective capability view
//! over the live server pool.

use std::collections::BTreeMap;

use gateway_types::schema::{CapabilityItem, PermissionsBlob, PreferencesBlob, ServerCapabilityMask};
use gateway_types::{AdvertisedCapabilities, EffectiveCapabilityView, EffectiveItem, EffectiveServerView, Server};

fn admin_mask<'a>(permissions: &'a PermissionsBlob, server_id: &str) -> Option<&'a ServerCapabilityMask> {
    permissions.0.get(server_id)
}

fn user_overlay<'a>(preferences: &'a PreferencesBlob, server_id: &str) -> Option<&'a ServerCapabilityMask> {
    preferences.0.get(server_id)
}

/// Applies the admin mask and user overlay to one capability kind (tools,
/// resources, or prompts) of one server, per §4.5 steps 2-3.
fn derive_items<T>(
    ground_truth: &[T],
    name_of: impl Fn(&T) -> &str,
    description_of: impl Fn(&T) -> Option<String>,
    admin: Option<&BTreeMap<String, CapabilityItem>>,
    overlay: Option<&BTreeMap<String, CapabilityItem>>,
) -> BTreeMap<String, EffectiveItem> {
    let mut out = BTreeMap::new();
    for item in ground_truth {
        let name = name_of(item);
        // Admin mask present -> respect it; absent -> all-enabled by default.
        let mut enabled = admin.and_then(|m| m.get(name)).map(|i| i.enabled).unwrap_or(true);
        let danger_level = admin
            .and_then(|m| m.get(name))
            .and_then(|i| i.metadata.get("dangerLevel"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        // User overlay only honors `enabled` on existing items; unknown
        // overlay entries (not in ground truth) are ignored by construction
        // since we only look them up by a name that is already known.
        if let Some(user_item) = overlay.and_then(|m| m.get(name)) {
            enabled = user_item.enabled;
        }

        out.insert(
            name.to_string(),
            EffectiveItem {
                enabled,
                description: description_of(item),
                danger_level,
            },
        );
    }
    out
}

/// Computes the effective view of one server for one user (§4.5
/// derivation steps 1-4).
#[must_use]
pub fn compute_server_view(
    server: &Server,
    permissions: &PermissionsBlob,
    preferences: &PreferencesBlob,
    configured: bool,
) -> EffectiveServerView {
    let admin = admin_mask(permissions, &server.server_id);
    let overlay = user_overlay(preferences, &server.server_id);
    let AdvertisedCapabilities { tools, resources, prompts } = &server.cached_capabilities;

    EffectiveServerView {
        enabled: server.enabled,
        server_name: server.server_name.clone(),
        allow_user_input: server.allow_user_input,
        auth_type: server.auth_type,
        config_template: server.config_template.clone(),
        configured,
        tools: derive_items(
            tools,
            |t| t.name.as_str(),
            |t| t.description.clone(),
            admin.map(|m| &m.tools),
            overlay.map(|m| &m.tools),
        ),
        resources: derive_items(
            resources,
            |r| r.uri.as_str(),
            |r| r.description.clone(),
            admin.map(|m| &m.resources),
            overlay.map(|m| &m.resources),
        ),
        prompts: derive_items(
            prompts,
            |p| p.name.as_str(),
            |p| p.description.clone(),
            admin.map(|m| &m.prompts),
            overlay.map(|m| &m.prompts),
        ),
    }
}

/// Computes a user's full effective capability view over every enabled
/// server in the live pool (§4.5).
///
/// `is_configured` answers "does `launchConfigs[serverId]` exist" for
/// `allowUserInput` servers; non-`allowUserInput` servers are always
/// `configured = true` (§4.5 step 4).
#[must_use]
pub fn compute_effective_view(
    servers: &[Server],
    permissions: &PermissionsBlob,
    preferences: &PreferencesBlob,
    is_configured: impl Fn(&str) -> bool,
) -> EffectiveCapabilityView {
    let mut view = BTreeMap::new();
    for server in servers.iter().filter(|s| s.enabled) {
        let configured = if server.allow_user_input {
            is_configured(&server.server_id)
        } else {
            true
        };
        view.insert(
            server.server_id.clone(),
            compute_server_view(server, permissions, preferences, configured),
        );
    }
    EffectiveCapabilityView(view)
}
