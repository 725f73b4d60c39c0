//! Agent-side dispatch: decoded requests in, typed results out.
//!
//! This layer routes the method catalog onto the registry, the prompt
//! engine, and the permission policy. It does not own a transport; the
//! stdio connection and the WebSocket router both feed it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::methods;
use crate::permission::{PermissionPolicy, PermissionRequester};
use crate::prompt::{Notifier, PromptEngine, PromptRequest};
use crate::rpc::{RequestId, RpcError};
use crate::session::{SessionId, SessionRegistry};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Protocol version this agent speaks.
    pub protocol_version: u16,
    /// Serve the unstable method superset.
    pub enable_unstable: bool,
    /// Serve the project extension methods.
    pub enable_extensions: bool,
    pub agent_name: String,
    pub agent_version: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            enable_unstable: true,
            enable_extensions: true,
            agent_name: "agora".into(),
            agent_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub load_session: bool,
    pub session_fork: bool,
    pub session_list: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    pub protocol_version: u16,
    #[serde(default)]
    pub client_info: Option<Implementation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    pub protocol_version: u16,
    pub agent_info: Implementation,
    pub agent_capabilities: AgentCapabilities,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSessionRequest {
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSessionRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSessionResponse {
    pub session_id: SessionId,
    pub mode: String,
    pub current_model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsRequest {
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkSessionRequest {
    pub session_id: SessionId,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkSessionResponse {
    pub session_id: SessionId,
    pub parent_session_id: SessionId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModeRequest {
    pub session_id: SessionId,
    pub mode: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModelRequest {
    pub session_id: SessionId,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConfigOptionRequest {
    pub session_id: SessionId,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdParams {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSessionResponse {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequestParams {
    pub request_id: RequestId,
}

/// Anything the router can forward decoded messages to.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn handle_request(
        &self,
        id: &RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError>;

    async fn handle_notification(&self, method: &str, params: Option<Value>);
}

/// The agent service: registry + engine + policy behind the catalog.
pub struct AgentService {
    config: ServiceConfig,
    registry: SessionRegistry,
    engine: PromptEngine,
    policy: Arc<PermissionPolicy>,
    notifier: Notifier,
    requester: Arc<dyn PermissionRequester>,
}

impl AgentService {
    pub fn new(
        config: ServiceConfig,
        registry: SessionRegistry,
        engine: PromptEngine,
        policy: Arc<PermissionPolicy>,
        notifier: Notifier,
        requester: Arc<dyn PermissionRequester>,
    ) -> Self {
        Self {
            config,
            registry,
            engine,
            policy,
            notifier,
            requester,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &PromptEngine {
        &self.engine
    }

    /// Whether the catalog, as configured, serves this method.
    fn serves(&self, method: &str) -> bool {
        if methods::is_stable(method) {
            return true;
        }
        if methods::is_unstable(method) {
            return self.config.enable_unstable;
        }
        if methods::is_extension(method) {
            return self.config.enable_extensions;
        }
        false
    }

    async fn dispatch(
        &self,
        id: &RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            methods::INITIALIZE => {
                let request: InitializeRequest = decode_params(params)?;
                if request.protocol_version != self.config.protocol_version {
                    return Err(RpcError::invalid_params()
                        .with_detail(format!(
                            "unsupported protocol version: {}",
                            request.protocol_version
                        )));
                }
                encode_result(InitializeResponse {
                    protocol_version: self.config.protocol_version,
                    agent_info: Implementation {
                        name: self.config.agent_name.clone(),
                        version: self.config.agent_version.clone(),
                    },
                    agent_capabilities: AgentCapabilities {
                        load_session: true,
                        session_fork: self.config.enable_unstable,
                        session_list: self.config.enable_unstable,
                    },
                })
            }
            methods::AUTHENTICATE => encode_result(serde_json::json!({})),
            methods::SESSION_NEW => {
                let request: NewSessionRequest = decode_params(params)?;
                let state = self.registry.new_session(request.cwd).map_err(rpc_error)?;
                encode_result(NewSessionResponse {
                    session_id: state.id,
                })
            }
            methods::SESSION_LOAD => {
                let request: LoadSessionRequest = decode_params(params)?;
                let state = self.registry.load(&request.session_id).map_err(rpc_error)?;
                encode_result(LoadSessionResponse {
                    session_id: state.id,
                    mode: state.mode,
                    current_model: state.current_model,
                })
            }
            methods::SESSION_LIST => {
                let request: ListSessionsRequest = decode_params(params)?;
                let page = self
                    .registry
                    .list(request.cursor.as_deref())
                    .map_err(rpc_error)?;
                encode_result(page)
            }
            methods::SESSION_FORK => {
                let request: ForkSessionRequest = decode_params(params)?;
                let state = self
                    .registry
                    .fork(&request.session_id, request.cwd)
                    .await
                    .map_err(rpc_error)?;
                encode_result(ForkSessionResponse {
                    session_id: state.id,
                    parent_session_id: request.session_id,
                })
            }
            methods::SESSION_SET_MODE => {
                let request: SetModeRequest = decode_params(params)?;
                self.registry
                    .set_mode(&request.session_id, request.mode)
                    .map_err(rpc_error)?;
                encode_result(serde_json::json!({}))
            }
            methods::SESSION_SET_MODEL => {
                let request: SetModelRequest = decode_params(params)?;
                self.registry
                    .set_model(&request.session_id, request.model)
                    .map_err(rpc_error)?;
                encode_result(serde_json::json!({}))
            }
            methods::SESSION_SET_CONFIG_OPTION => {
                let request: SetConfigOptionRequest = decode_params(params)?;
                self.registry
                    .set_config_option(&request.session_id, request.key, request.value)
                    .map_err(rpc_error)?;
                encode_result(serde_json::json!({}))
            }
            methods::SESSION_PROMPT => {
                let request: PromptRequest = decode_params(params)?;
                let response = self
                    .engine
                    .prompt(
                        &self.registry,
                        &self.notifier,
                        self.requester.as_ref(),
                        request,
                        Some(id),
                    )
                    .await
                    .map_err(rpc_error)?;
                encode_result(response)
            }
            methods::SESSION_STOP => {
                let request: SessionIdParams = decode_params(params)?;
                encode_result(self.engine.stop(&request.session_id))
            }
            methods::SESSION_DELETE => {
                let request: SessionIdParams = decode_params(params)?;
                self.registry.delete(&request.session_id);
                self.policy.clear(&request.session_id);
                encode_result(serde_json::json!({}))
            }
            methods::SESSION_EXPORT => {
                let request: SessionIdParams = decode_params(params)?;
                let content = self.registry.export(&request.session_id).map_err(rpc_error)?;
                encode_result(ExportSessionResponse { content })
            }
            methods::LOGOUT => {
                for session_id in self.registry.clear() {
                    self.policy.clear(&session_id);
                }
                encode_result(serde_json::json!({}))
            }
            _ => Err(RpcError::method_not_found().with_detail(method)),
        }
    }
}

#[async_trait]
impl RpcService for AgentService {
    async fn handle_request(
        &self,
        id: &RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        if !self.serves(method) {
            return Err(RpcError::method_not_found().with_detail(method));
        }
        tracing::debug!(%id, method, "handling request");
        self.dispatch(id, method, params).await
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            methods::SESSION_CANCEL => {
                let Ok(request) = decode_params::<SessionIdParams>(params) else {
                    tracing::warn!("malformed session/cancel notification");
                    return;
                };
                self.engine.cancel_session(&request.session_id);
            }
            methods::CANCEL_REQUEST => {
                let Ok(request) = decode_params::<CancelRequestParams>(params) else {
                    tracing::warn!("malformed request/cancel notification");
                    return;
                };
                self.engine.cancel_request(&request.request_id);
            }
            _ => {
                tracing::debug!(method, "ignoring notification");
            }
        }
    }
}

fn decode_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| RpcError::invalid_params().with_detail(e))
}

fn encode_result<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal_error().with_detail(e))
}

fn rpc_error(error: Error) -> RpcError {
    error.to_rpc_error()
}
