//! End-to-end coverage of the `/mcp` wire surface (§8): a request with no
//! token is rejected, a valid legacy token can complete the `initialize`
//! handshake, an established session can dispatch a tool call through a
//! fake upstream, and `DELETE /mcp` is always 200.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use gateway_admission::collaborators::in_memory::{InMemoryProxyRepository, InMemoryUserRepository};
use gateway_admission::{IpWhitelist, RateLimiter, TokenValidator, TokenValidatorConfig};
use gateway_router::{BroadcastRouter, RequestRouter};
use gateway_session::{ControlPlaneNotifier, SessionStore};
use gateway_store::durable::InMemoryDurableEventStore;
use gateway_store::EventStore;
use gateway_types::{
    AdvertisedCapabilities, AuthType, GatewayResult, LaunchConfigsBlob, PermissionsBlob, PreferencesBlob, Role, Server,
    ToolAdvert, User, UserStatus,
};
use gateway_upstream::{ServerEvent, ServerManager, UpstreamClient, UpstreamClientFactory};
use gateway_web::{AppState, ReverseTimeoutConfig};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct EchoUpstreamClient {
    capabilities: AdvertisedCapabilities,
}

#[async_trait]
impl UpstreamClient for EchoUpstreamClient {
    async fn connect(&self) -> GatewayResult<(AdvertisedCapabilities, mpsc::Receiver<ServerEvent>)> {
        let (_tx, rx) = mpsc::channel(1);
        Ok((self.capabilities.clone(), rx))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> GatewayResult<Value> {
        Ok(json!({ "echoed": name, "arguments": arguments }))
    }

    async fn read_resource(&self, _uri: &str, _meta: Value) -> GatewayResult<Value> {
        Ok(Value::Null)
    }

    async fn get_prompt(&self, _name: &str, _arguments: Value) -> GatewayResult<Value> {
        Ok(Value::Null)
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        Ok(())
    }
}

struct FakeFactory {
    build_calls: AtomicUsize,
}

#[async_trait]
impl UpstreamClientFactory for FakeFactory {
    async fn build(&self, server: &Server) -> GatewayResult<Arc<dyn UpstreamClient>> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(EchoUpstreamClient {
            capabilities: server.cached_capabilities.clone(),
        }))
    }
}

const RAW_LEGACY_TOKEN: &str = "a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1";

fn legacy_user_id() -> String {
    gateway_admission::token::derive_legacy_user_id(RAW_LEGACY_TOKEN)
}

async fn spawn_test_gateway() -> SocketAddr {
    assert_eq!(RAW_LEGACY_TOKEN.len(), 128);

    let users = Arc::new(InMemoryUserRepository::new());
    users.insert(User {
        user_id: legacy_user_id(),
        role: Role::User,
        status: UserStatus::Enabled,
        permissions: PermissionsBlob::default(),
        user_preferences: PreferencesBlob::default(),
        launch_configs: LaunchConfigsBlob::default(),
        expires_at: 0,
        rate_limit: 1_000,
    });
    let proxies = Arc::new(InMemoryProxyRepository::disabled());

    let tokens = Arc::new(TokenValidator::new(
        users,
        TokenValidatorConfig {
            jwt_secret: SecretString::from("test-secret".to_string()),
        },
    ));
    let ip_whitelist = Arc::new(IpWhitelist::new(proxies));
    let rate_limiter = Arc::new(RateLimiter::new());

    let durable = Arc::new(InMemoryDurableEventStore::new());
    let events = Arc::new(EventStore::new(durable, gateway_store::EventStoreConfig::default()));

    let sessions = Arc::new(SessionStore::new());
    let broadcast_cell: Arc<OnceLock<Arc<BroadcastRouter>>> = Arc::new(OnceLock::new());

    let factory = Arc::new(FakeFactory {
        build_calls: AtomicUsize::new(0),
    });
    let servers = Arc::new(ServerManager::new(factory, None));

    let broadcast = Arc::new(BroadcastRouter::new(sessions.clone(), servers.clone(), events.clone()));
    broadcast_cell.set(broadcast.clone()).expect("cell set once");

    let router = Arc::new(RequestRouter::new(sessions.clone(), servers.clone(), events.clone(), None));
    let control_plane = Arc::new(ControlPlaneNotifier::new());

    let seeded_server = Server {
        server_id: "s1".into(),
        server_name: "Server One".into(),
        enabled: true,
        auth_type: AuthType::ApiKey,
        allow_user_input: false,
        config_template: BTreeMap::new(),
        cached_capabilities: AdvertisedCapabilities {
            tools: vec![ToolAdvert {
                name: "echo".into(),
                description: Some("echoes its arguments".into()),
            }],
            resources: Vec::new(),
            prompts: Vec::new(),
        },
    };
    servers.bootstrap(vec![seeded_server]).await;

    let state = AppState {
        sessions,
        servers,
        events,
        router,
        broadcast,
        control_plane,
        ip_whitelist,
        tokens,
        rate_limiter,
        logs: None,
        base_url: "http://localhost".into(),
        reverse_timeouts: ReverseTimeoutConfig::default(),
    };

    let app = gateway_web::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("server");
    });
    addr
}

#[tokio::test]
async fn request_without_token_is_rejected() {
    let addr = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/mcp"))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {},
        }))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn initialize_then_tool_call_round_trips() {
    let addr = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let init_response = client
        .post(format!("http://{addr}/mcp"))
        .bearer_auth(RAW_LEGACY_TOKEN)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": { "protocolVersion": "2025-06-18", "capabilities": {} },
        }))
        .send()
        .await
        .expect("initialize request");

    assert_eq!(init_response.status(), reqwest::StatusCode::OK);
    let session_id = init_response
        .headers()
        .get("mcp-session-id")
        .expect("session id header")
        .to_str()
        .expect("ascii header")
        .to_string();
    let init_body: Value = init_response.json().await.expect("initialize body");
    assert_eq!(init_body["result"]["serverInfo"]["name"], "mcp-gateway");

    let call_response = client
        .post(format!("http://{addr}/mcp"))
        .bearer_auth(RAW_LEGACY_TOKEN)
        .header("mcp-session-id", &session_id)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": { "serverId": "s1", "name": "echo", "arguments": { "x": 1 } },
        }))
        .send()
        .await
        .expect("tool call request");

    assert_eq!(call_response.status(), reqwest::StatusCode::OK);
    let call_body: Value = call_response.json().await.expect("tool call body");
    assert_eq!(call_body["result"]["echoed"], "echo");
    assert_eq!(call_body["result"]["arguments"]["x"], 1);
}

#[tokio::test]
async fn delete_for_unknown_session_is_always_ok() {
    let addr = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .delete(format!("http://{addr}/mcp"))
        .header("mcp-session-id", "does-not-exist")
        .send()
        .await
        .expect("delete request");

    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn unknown_tool_on_established_session_is_rejected() {
    let addr = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let init_response = client
        .post(format!("http://{addr}/mcp"))
        .bearer_auth(RAW_LEGACY_TOKEN)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {},
        }))
        .send()
        .await
        .expect("initialize request");
    let session_id = init_response
        .headers()
        .get("mcp-session-id")
        .expect("session id header")
        .to_str()
        .expect("ascii header")
        .to_string();

    let call_response = client
        .post(format!("http://{addr}/mcp"))
        .bearer_auth(RAW_LEGACY_TOKEN)
        .header("mcp-session-id", &session_id)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": { "serverId": "s1", "name": "not-a-real-tool", "arguments": {} },
        }))
        .send()
        .await
        .expect("tool call request");

    assert_ne!(call_response.status(), reqwest::StatusCode::OK);
}
