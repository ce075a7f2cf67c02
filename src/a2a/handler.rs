//! JSON-RPC 2.0 handler for the orchestration endpoint.
//!
//! Dispatches JSON-RPC methods:
//! - `message/send` → run one orchestration, reply with the aggregated message
//! - `tasks/get`    → plan record (status + per-task state)
//! - `tasks/cancel` → cancel a running plan

use crate::a2a::orchestrator::{OrchestrationRequest, Orchestrator, PlanLookupError};
use crate::a2a::types::*;
use crate::error::A2aError;
use serde::de::DeserializeOwned;
use serde_json::json;

/// Dispatch a JSON-RPC request to the appropriate handler.
pub async fn dispatch(req: JsonRpcRequest, orchestrator: &Orchestrator) -> JsonRpcResponse {
    match req.method.as_str() {
        methods::MESSAGE_SEND => handle_send_message(req.id, req.params, orchestrator).await,
        methods::TASKS_GET => handle_get_task(req.id, req.params, orchestrator),
        methods::TASKS_CANCEL => handle_cancel_task(req.id, req.params, orchestrator),
        methods::MESSAGE_STREAM => JsonRpcResponse::error(
            req.id,
            error_codes::UNSUPPORTED_OPERATION,
            "Streaming replies are not offered by this gateway; use message/send",
        ),
        _ => JsonRpcResponse::error(
            req.id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", req.method),
        ),
    }
}

fn parse_params<T: DeserializeOwned>(
    id: &serde_json::Value,
    params: serde_json::Value,
) -> Result<T, JsonRpcResponse> {
    serde_json::from_value(params).map_err(|e| {
        JsonRpcResponse::error(
            id.clone(),
            error_codes::INVALID_PARAMS,
            format!("Invalid params: {}", e),
        )
    })
}

/// Error envelope for a failed orchestration. `data.kind` is the error
/// kind; total failure also lists every sub-task failure.
pub fn error_response(id: serde_json::Value, err: &A2aError) -> JsonRpcResponse {
    let mut data = json!({ "kind": err.kind() });
    if let Some(agent) = err.agent() {
        data["agent"] = json!(agent);
    }
    if let A2aError::AllTasksFailed { failures, .. } = err {
        data["failures"] = json!(failures);
    }
    JsonRpcResponse::error_with_data(id, err.rpc_code(), err.to_string(), data)
}

async fn handle_send_message(
    id: serde_json::Value,
    params: serde_json::Value,
    orchestrator: &Orchestrator,
) -> JsonRpcResponse {
    let send_params: SendMessageParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let mut message = send_params.message;
    if !send_params.accepted_output_modes.is_empty() {
        message.accepted_output_modes = send_params.accepted_output_modes;
    }
    tracing::info!(
        session = ?send_params.session_id,
        plan = ?send_params.id,
        "A2A: message/send: {}",
        crate::utils::truncate_str(&message.text(), 100)
    );

    let request = OrchestrationRequest {
        plan_id: send_params.id,
        session_id: send_params.session_id,
        message,
    };
    match orchestrator.handle(request).await {
        Ok(reply) => {
            let mut message = reply.message;
            message
                .metadata
                .insert("session_id".to_string(), json!(reply.session_id));
            let body = serde_json::to_value(&message)
                .unwrap_or_else(|_| json!({"error": "serialize"}));
            JsonRpcResponse::success(id, body)
        }
        Err(e) => {
            tracing::warn!(error = %e, "A2A: Orchestration failed");
            error_response(id, &e)
        }
    }
}

fn lookup_error(id: serde_json::Value, err: PlanLookupError) -> JsonRpcResponse {
    let code = match err {
        PlanLookupError::NotFound(_) => error_codes::TASK_NOT_FOUND,
        PlanLookupError::NotCancelable { .. } => error_codes::TASK_NOT_CANCELABLE,
    };
    JsonRpcResponse::error(id, code, err.to_string())
}

fn handle_get_task(
    id: serde_json::Value,
    params: serde_json::Value,
    orchestrator: &Orchestrator,
) -> JsonRpcResponse {
    let get_params: GetTaskParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match orchestrator.plan_record(&get_params.id) {
        Ok(record) => JsonRpcResponse::success(
            id,
            serde_json::to_value(&record).unwrap_or_else(|_| json!({"error": "serialize"})),
        ),
        Err(e) => lookup_error(id, e),
    }
}

fn handle_cancel_task(
    id: serde_json::Value,
    params: serde_json::Value,
    orchestrator: &Orchestrator,
) -> JsonRpcResponse {
    let cancel_params: CancelTaskParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match orchestrator.cancel(&cancel_params.id) {
        Ok(record) => JsonRpcResponse::success(
            id,
            json!({ "id": record.id, "cancelled": true }),
        ),
        Err(e) => lookup_error(id, e),
    }
}
