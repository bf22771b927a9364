//! # Iris MCP Service
//!
//! `IrisMcpService` implements `rmcp::ServerHandler`, exposing the
//! orchestrator verbs as MCP tools. The transport prefixes tool names
//! with the server identifier, so `tell` surfaces to clients as
//! `iris__tell`.
//!
//! Every tool returns a JSON envelope. Verb-level failures (unknown team,
//! pool full, timeout) come back as structured error envelopes with
//! `is_error` set, so callers can distinguish retryable conditions;
//! malformed arguments are protocol errors and reject the call outright.

use rmcp::{
    handler::server::ServerHandler,
    model::{
        CallToolRequestParam, CallToolResult, Content, ErrorData as McpError, Implementation,
        ListToolsResult, PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo,
        Tool, ToolsCapability,
    },
    service::{RequestContext, RoleServer},
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use uuid::Uuid;

use crate::{error::OrchestratorError, orchestrator::Orchestrator};

/// Server handler bridging the MCP transport to the orchestrator.
#[derive(Clone)]
pub struct IrisMcpService {
    pub orchestrator: Arc<Orchestrator>,
}

impl IrisMcpService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    fn schema(properties: Value, required: &[&str]) -> Arc<Map<String, Value>> {
        let mut schema = Map::new();
        schema.insert("type".to_string(), Value::String("object".to_string()));
        schema.insert(
            "properties".to_string(),
            properties,
        );
        if !required.is_empty() {
            schema.insert("required".to_string(), json!(required));
        }
        Arc::new(schema)
    }

    fn tool(
        name: &str,
        description: &str,
        properties: Value,
        required: &[&str],
    ) -> Tool {
        Tool {
            name: name.to_string().into(),
            title: Some(name.to_string()),
            icons: None,
            description: Some(description.to_string().into()),
            input_schema: Self::schema(properties, required),
            output_schema: None,
            annotations: None,
            meta: None,
        }
    }

    fn team_property() -> Value {
        json!({"type": "string", "description": "Name of the target team"})
    }

    fn from_team_property() -> Value {
        json!({"type": "string", "description": "Calling team; omit for external callers"})
    }

    fn success(value: &impl serde::Serialize) -> Result<CallToolResult, McpError> {
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    fn failure(error: OrchestratorError) -> Result<CallToolResult, McpError> {
        let envelope = error.to_envelope();
        let text = envelope.to_string();
        let mut result = CallToolResult::success(vec![Content::text(text)]);
        result.is_error = Some(true);
        Ok(result)
    }

    fn reply(
        outcome: std::result::Result<impl serde::Serialize, OrchestratorError>,
    ) -> Result<CallToolResult, McpError> {
        match outcome {
            Ok(value) => Self::success(&value),
            Err(error) => Self::failure(error),
        }
    }
}

fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, McpError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            McpError::invalid_params(format!("missing required string argument '{}'", key), None)
        })
}

fn optional_str<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn optional_bool(args: &Map<String, Value>, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn optional_u64(args: &Map<String, Value>, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}

fn optional_uuid(args: &Map<String, Value>, key: &str) -> Result<Option<Uuid>, McpError> {
    match args.get(key).and_then(Value::as_str) {
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| McpError::invalid_params(format!("'{}' is not a valid UUID", key), None)),
        None => Ok(None),
    }
}

#[async_trait::async_trait]
#[allow(clippy::manual_async_fn)] // Required by rmcp ServerHandler trait
impl ServerHandler for IrisMcpService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "iris".to_string(),
                title: Some("iris".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Orchestrates a fleet of assistant subprocesses, one per named team. \
                 Use tell for request/reply, quick_tell for fire-and-forget, wake/sleep \
                 for lifecycle, and teams_get_status for an overview."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move {
            let tools = vec![
                Self::tool(
                    "tell",
                    "Send a message to a team's assistant and wait for the reply. \
                     Set awaitReply=false to return as soon as the request is queued; \
                     if delivery is impossible a notification is left instead.",
                    json!({
                        "team": Self::team_property(),
                        "content": {"type": "string", "description": "Message for the assistant"},
                        "fromTeam": Self::from_team_property(),
                        "awaitReply": {"type": "boolean", "description": "Wait for the reply (default true)"},
                        "timeoutMs": {"type": "integer", "description": "Reply deadline in milliseconds"},
                    }),
                    &["team", "content"],
                ),
                Self::tool(
                    "quick_tell",
                    "Fire-and-forget message: queued on the live assistant, or stored \
                     as a notification when the team is asleep. Never wakes a team.",
                    json!({
                        "team": Self::team_property(),
                        "content": {"type": "string", "description": "Message for the assistant"},
                        "fromTeam": Self::from_team_property(),
                    }),
                    &["team", "content"],
                ),
                Self::tool(
                    "wake",
                    "Ensure a team's assistant is running. Returns 'awake' if it already \
                     was, 'waking' if a fresh process was spawned.",
                    json!({
                        "team": Self::team_property(),
                        "fromTeam": Self::from_team_property(),
                        "clearCache": {"type": "boolean", "description": "Clear the output cache (default true)"},
                    }),
                    &["team"],
                ),
                Self::tool(
                    "sleep",
                    "Terminate a team's assistant. With force=true queued requests are \
                     dropped and their count is reported as lostMessages.",
                    json!({
                        "team": Self::team_property(),
                        "force": {"type": "boolean", "description": "Kill immediately (default false)"},
                        "clearCache": {"type": "boolean", "description": "Clear the output cache (default true)"},
                    }),
                    &["team"],
                ),
                Self::tool(
                    "cancel",
                    "Cancel a request. With requestId a queued request is removed before \
                     it reaches the assistant; without it the current inflight request is \
                     interrupted.",
                    json!({
                        "team": Self::team_property(),
                        "requestId": {"type": "string", "description": "UUID of the request to cancel"},
                    }),
                    &["team"],
                ),
                Self::tool(
                    "reboot",
                    "Force-sleep then wake a team, starting a fresh process on the same session.",
                    json!({"team": Self::team_property()}),
                    &["team"],
                ),
                Self::tool(
                    "delete",
                    "Sleep a team and invalidate every session into it. Notification \
                     history is preserved.",
                    json!({"team": Self::team_property()}),
                    &["team"],
                ),
                Self::tool(
                    "report",
                    "Snapshot of the team's recent stdout/stderr output, including \
                     post-mortem output of a crashed assistant.",
                    json!({"team": Self::team_property()}),
                    &["team"],
                ),
                Self::tool(
                    "teams_get_status",
                    "Status document for the fleet or a single team: liveness, process \
                     metrics, pool occupancy and pending notifications.",
                    json!({
                        "team": {"type": "string", "description": "Restrict to one team (optional)"},
                        "includeNotifications": {"type": "boolean", "description": "Include notification summaries (default true)"},
                    }),
                    &[],
                ),
                Self::tool(
                    "notifications_mark_read",
                    "Acknowledge notifications for a team: one by id, or all pending \
                     ones when no id is given.",
                    json!({
                        "team": Self::team_property(),
                        "notificationId": {"type": "string", "description": "UUID of one notification (optional)"},
                    }),
                    &["team"],
                ),
            ];

            Ok(ListToolsResult {
                meta: None,
                tools,
                next_cursor: None,
            })
        }
    }

    fn call_tool(
        &self,
        params: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            let args = params.arguments.unwrap_or_default();
            let verb = params.name.as_ref();
            tracing::debug!("Tool call '{}' with {} argument(s)", verb, args.len());

            match verb {
                "tell" => {
                    let team = required_str(&args, "team")?;
                    let content = required_str(&args, "content")?;
                    let from_team = optional_str(&args, "fromTeam");
                    let await_reply = optional_bool(&args, "awaitReply", true);
                    let timeout_ms = optional_u64(&args, "timeoutMs");
                    Self::reply(
                        self.orchestrator
                            .tell(from_team, team, content, await_reply, timeout_ms)
                            .await,
                    )
                }
                "quick_tell" => {
                    let team = required_str(&args, "team")?;
                    let content = required_str(&args, "content")?;
                    let from_team = optional_str(&args, "fromTeam");
                    Self::reply(self.orchestrator.quick_tell(from_team, team, content).await)
                }
                "wake" => {
                    let team = required_str(&args, "team")?;
                    let from_team = optional_str(&args, "fromTeam");
                    let clear_cache = optional_bool(&args, "clearCache", true);
                    Self::reply(self.orchestrator.wake(team, from_team, clear_cache).await)
                }
                "sleep" => {
                    let team = required_str(&args, "team")?;
                    let force = optional_bool(&args, "force", false);
                    let clear_cache = optional_bool(&args, "clearCache", true);
                    Self::reply(self.orchestrator.sleep(team, force, clear_cache).await)
                }
                "cancel" => {
                    let team = required_str(&args, "team")?;
                    let request_id = optional_uuid(&args, "requestId")?;
                    Self::reply(self.orchestrator.cancel(team, request_id).await)
                }
                "reboot" => {
                    let team = required_str(&args, "team")?;
                    Self::reply(self.orchestrator.reboot(team).await)
                }
                "delete" => {
                    let team = required_str(&args, "team")?;
                    Self::reply(self.orchestrator.delete(team).await)
                }
                "report" => {
                    let team = required_str(&args, "team")?;
                    Self::reply(self.orchestrator.report(team).await)
                }
                "teams_get_status" => {
                    let team = optional_str(&args, "team");
                    let include = optional_bool(&args, "includeNotifications", true);
                    Self::reply(self.orchestrator.teams_get_status(team, include).await)
                }
                "notifications_mark_read" => {
                    let team = required_str(&args, "team")?;
                    let id = optional_uuid(&args, "notificationId")?;
                    match self.orchestrator.notifications_mark_read(team, id).await {
                        Ok(marked) => Self::success(&json!({
                            "team": team,
                            "markedRead": marked,
                        })),
                        Err(error) => Self::failure(error),
                    }
                }
                other => Err(McpError::invalid_params(
                    format!("unknown tool '{}'", other),
                    None,
                )),
            }
        }
    }
}
