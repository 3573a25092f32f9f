//! Entities of the gateway's data model (§3). These are semantic types,
//! not storage types — persistence is a (collaborator) repository concern.

use crate::schema::{LaunchConfigsBlob, PermissionsBlob, PreferencesBlob};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Role {
    Owner,
    Admin,
    User,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum UserStatus {
    Enabled,
    Disabled,
    Pending,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// 32-hex derived from token (legacy path) or subject claim (JWT path).
    pub user_id: String,
    pub role: Role,
    pub status: UserStatus,
    #[serde(skip)]
    pub permissions: PermissionsBlob,
    #[serde(skip)]
    pub user_preferences: PreferencesBlob,
    #[serde(skip)]
    pub launch_configs: LaunchConfigsBlob,
    /// 0 means "never expires".
    pub expires_at: i64,
    /// Requests per 60s window.
    pub rate_limit: u32,
}

impl User {
    #[must_use]
    pub fn is_expired(&self, now_unix_secs: i64) -> bool {
        self.expires_at > 0 && now_unix_secs > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    Google,
    Notion,
    Figma,
    GitHub,
    Stripe,
    Zendesk,
    Canvas,
    Peta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAdvert {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAdvert {
    pub uri: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptAdvert {
    pub name: String,
    pub description: Option<String>,
}

/// Advertised capabilities of one upstream server — ground truth (§3 "A
/// Server Context's advertised capability set is the ground truth").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedCapabilities {
    pub tools: Vec<ToolAdvert>,
    pub resources: Vec<ResourceAdvert>,
    pub prompts: Vec<PromptAdvert>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub server_id: String,
    pub server_name: String,
    pub enabled: bool,
    pub auth_type: AuthType,
    /// Whether this server expects per-user credentials (yields per-user
    /// Server Contexts, §3 invariant).
    pub allow_user_input: bool,
    /// Placeholder scheme for user-supplied secrets, e.g. `{{API_KEY}}`.
    pub config_template: BTreeMap<String, String>,
    #[serde(default)]
    pub cached_capabilities: AdvertisedCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub name: String,
    pub proxy_key: String,
    pub log_webhook_url: Option<String>,
    pub last_synced_log_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ServerStatus {
    Online,
    Offline,
    Connecting,
    Error,
    Sleeping,
}

/// Reasons a Client Session was closed, carried into close-related log
/// entries and control-plane notifications (§4.3, §8 scenarios).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    ClientRequested,
    SessionTimeout,
    UserDisabled,
    UserDeleted,
    UserExpired,
    PermissionRevoked,
    ServerShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SessionLifecycleState {
    Initializing,
    Active,
    Closing,
    Closed,
}

/// An appended JSON-RPC message on a stream (§3 "Event").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub stream_id: String,
    pub session_id: String,
    pub message_type: String,
    pub message_data: String,
    pub created_at_millis: u128,
    pub expires_at_millis: u128,
}

/// Numeric audit action codes (§3 "Log entry"). Kept as an enum rather
/// than raw integers so call sites can't typo an action name; `as i32`
/// gives the numeric code when persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum LogAction {
    AuthRateLimit = 1,
    RequestTool = 10,
    ResponseTool = 11,
    RequestResource = 12,
    ResponseResource = 13,
    RequestPrompt = 14,
    ResponsePrompt = 15,
    ReverseSamplingRequest = 20,
    ReverseSamplingResponse = 21,
    ReverseRootsRequest = 22,
    ReverseRootsResponse = 23,
    ReverseElicitRequest = 24,
    ReverseElicitResponse = 25,
    ServerInit = 30,
    ServerClose = 31,
    ServerStatusChange = 32,
    SessionCreated = 40,
    SessionClosed = 41,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub action: LogAction,
    pub user_id: Option<String>,
    pub server_id: Option<String>,
    pub session_id: Option<String>,
    pub upstream_request_id: Option<String>,
    pub uniform_request_id: String,
    pub parent_uniform_request_id: Option<String>,
    pub ip: String,
    pub user_agent: Option<String>,
    pub token_mask: String,
    pub request_params: Option<String>,
    pub response_result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub status_code: u16,
}

/// Snapshot of the authenticated principal attached to a request/session
/// (§4.1 "returns an `AuthContext`").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    /// `first8…last8` of the raw token.
    pub token_mask: String,
    pub role: Role,
    pub status: UserStatus,
    pub permissions: PermissionsBlob,
    pub preferences: PreferencesBlob,
    pub launch_configs: LaunchConfigsBlob,
    pub authenticated_at_millis: u128,
    pub expires_at: i64,
    pub rate_limit: u32,
}

/// One capability of one server in a user's effective view (§4.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveServerView {
    pub enabled: bool,
    pub server_name: String,
    pub allow_user_input: bool,
    pub auth_type: AuthType,
    pub config_template: BTreeMap<String, String>,
    pub configured: bool,
    pub tools: BTreeMap<String, EffectiveItem>,
    pub resources: BTreeMap<String, EffectiveItem>,
    pub prompts: BTreeMap<String, EffectiveItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveItem {
    pub enabled: bool,
    pub description: Option<String>,
    pub danger_level: Option<String>,
}

/// A user's full effective capability view: `serverId -> view`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveCapabilityView(pub BTreeMap<String, EffectiveServerView>);

/// Result of `comparePermissions(old, new)` (§4.5): which `list_changed`
/// notifications a live session needs to emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionDelta {
    pub tools_changed: bool,
    pub resources_changed: bool,
    pub prompts_changed: bool,
}

impl PermissionDelta {
    #[must_use]
    pub fn any_changed(&self) -> bool {
        self.tools_changed || self.resources_changed || self.prompts_changed
    }
}

fn enabled_item_names(items: &BTreeMap<String, EffectiveItem>) -> BTreeSet<&str> {
    items
        .iter()
        .filter(|(_, i)| i.enabled)
        .map(|(n, _)| n.as_str())
        .collect()
}

/// Computes which of tools/resources/prompts changed enabled-membership
/// for one server between two snapshots. Name-level membership only —
/// opaque-description edits never trigger a notification (§4.5).
#[must_use]
pub fn compare_server_permissions(
    old: &EffectiveServerView,
    new: &EffectiveServerView,
) -> PermissionDelta {
    PermissionDelta {
        tools_changed: enabled_item_names(&old.tools) != enabled_item_names(&new.tools),
        resources_changed: enabled_item_names(&old.resources) != enabled_item_names(&new.resources),
        prompts_changed: enabled_item_names(&old.prompts) != enabled_item_names(&new.prompts),
    }
}

/// Computes the aggregate delta across every server in a user's view.
#[must_use]
pub fn compare_permissions(
    old: &EffectiveCapabilityView,
    new: &EffectiveCapabilityView,
) -> PermissionDelta {
    let mut delta = PermissionDelta::default();
    let all_servers: BTreeSet<&String> = old.0.keys().chain(new.0.keys()).collect();
    for server_id in all_servers {
        let empty = EffectiveServerView {
            enabled: false,
            server_name: String::new(),
            allow_user_input: false,
            auth_type: AuthType::ApiKey,
            config_template: BTreeMap::new(),
            configured: false,
            tools: BTreeMap::new(),
            resources: BTreeMap::new(),
            prompts: BTreeMap::new(),
        };
        let old_view = old.0.get(server_id).unwrap_or(&empty);
        let new_view = new.0.get(server_id).unwrap_or(&empty);
        let server_delta = compare_server_permissions(old_view, new_view);
        delta.tools_changed |= server_delta.tools_changed;
        delta.resources_changed |= server_delta.resources_changed;
        delta.prompts_changed |= server_delta.prompts_changed;
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(tools: &[(&str, bool)]) -> EffectiveServerView {
        EffectiveServerView {
            enabled: true,
            server_name: "s".into(),
            allow_user_input: false,
            auth_type: AuthType::ApiKey,
            config_template: BTreeMap::new(),
            configured: true,
            tools: tools
                .iter()
                .map(|(n, e)| {
                    (
                        (*n).to_string(),
                        EffectiveItem {
                            enabled: *e,
                            description: None,
                            danger_level: None,
                        },
                    )
                })
                .collect(),
            resources: BTreeMap::new(),
            prompts: BTreeMap::new(),
        }
    }

    #[test]
    fn description_only_edit_does_not_trigger_change() {
        let mut old = view(&[("t1", true)]);
        let mut new = old.clone();
        old.tools.get_mut("t1").unwrap().description = Some("v1".into());
        new.tools.get_mut("t1").unwrap().description = Some("v2".into());
        let delta = compare_server_permissions(&old, &new);
        assert!(!delta.any_changed());
    }

    #[test]
    fn toggling_enabled_triggers_tools_changed() {
        let old = view(&[("t1", true)]);
        let new = view(&[("t1", false)]);
        let delta = compare_server_permissions(&old, &new);
        assert!(delta.tools_changed);
        assert!(!delta.resources_changed && !delta.prompts_changed);
    }

    #[test]
    fn user_expiry_check() {
        let mut user = User {
            user_id: "u1".into(),
            role: Role::User,
            status: UserStatus::Enabled,
            permissions: PermissionsBlob::default(),
            user_preferences: PreferencesBlob::default(),
            launch_configs: LaunchConfigsBlob::default(),
            expires_at: 0,
            rate_limit: 60,
        };
        assert!(!user.is_expired(1_000_000));
        user.expires_at = 100;
        assert!(user.is_expired(200));
        assert!(!user.is_expired(50));
    }
}
