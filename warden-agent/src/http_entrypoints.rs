// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP entrypoint functions for the agent's exposed API.
//!
//! The API is the operator- and peer-facing control surface: status, node
//! info, the installer's bootstrap operations, and the principal's CSR-batch
//! signing service with its correlated reply store. TLS is terminated by
//! the fronting web proxy; the agent itself listens on localhost.

use crate::monitor::MonitorCore;
use crate::params::{
    InitializeDomainParams, InitializeNodeParams, RoutingRegistration,
    SetNodeInfoParams, SignBatchRequest, SignBatchResponse, StatusView,
};
use crate::roles::{ControllerError, RoleController};
use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseOk,
    HttpResponseUpdatedNoContent, Path, RequestContext, TypedBody,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Shared context of every endpoint.
pub struct ApiContext {
    pub core: Arc<MonitorCore>,
    pub controller: Arc<dyn RoleController>,
    /// Correlated replies to signed CSR batches, held for the submitter to
    /// poll.
    replies: Mutex<HashMap<Uuid, SignBatchResponse>>,
}

impl ApiContext {
    pub fn new(
        core: Arc<MonitorCore>,
        controller: Arc<dyn RoleController>,
    ) -> ApiContext {
        ApiContext { core, controller, replies: Mutex::new(HashMap::new()) }
    }
}

/// Returns a description of the agent API.
pub fn api() -> ApiDescription<Arc<ApiContext>> {
    fn register_endpoints(
        api: &mut ApiDescription<Arc<ApiContext>>,
    ) -> Result<(), String> {
        api.register(api_status)?;
        api.register(api_set_node_info)?;
        api.register(api_initialize_domain)?;
        api.register(api_initialize_node)?;
        api.register(api_submit_csr_batch)?;
        api.register(api_poll_csr_batch)?;
        api.register(api_register_routing)?;
        Ok(())
    }

    let mut api = ApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

fn http_error(err: ControllerError) -> HttpError {
    match &err {
        // The mismatch precondition and unsupported operations are the
        // caller's mistake, not ours.
        ControllerError::UnsupportedOperation(_) => {
            HttpError::for_bad_request(None, err.to_string())
        }
        _ if err.is_key_cert_mismatch() => {
            HttpError::for_bad_request(None, err.to_string())
        }
        ControllerError::DomainValidation(_) => {
            HttpError::for_bad_request(None, err.to_string())
        }
        _ => HttpError::for_internal_error(err.to_string()),
    }
}

#[endpoint {
    method = GET,
    path = "/status",
}]
async fn api_status(
    rqctx: RequestContext<Arc<ApiContext>>,
) -> Result<HttpResponseOk<StatusView>, HttpError> {
    let ctx = rqctx.context();
    let node = ctx
        .core
        .store()
        .node_identity()
        .await
        .map_err(|err| HttpError::for_internal_error(err.to_string()))?;
    let cluster_id = match ctx.core.store().cluster_config().await {
        Ok(config) => config.cluster_id,
        Err(_) => None,
    };
    Ok(HttpResponseOk(StatusView {
        state: ctx.core.state(),
        node_id: node.node_id,
        hostname: node.hostname,
        cluster_id,
    }))
}

#[endpoint {
    method = PUT,
    path = "/node-info",
}]
async fn api_set_node_info(
    rqctx: RequestContext<Arc<ApiContext>>,
    body: TypedBody<SetNodeInfoParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let params = body.into_inner();
    let store = ctx.core.store();
    let mut node = store
        .node_identity()
        .await
        .map_err(|err| HttpError::for_internal_error(err.to_string()))?;
    node.hostname = params.hostname;
    store
        .put_node_identity(&node)
        .await
        .map_err(|err| HttpError::for_internal_error(err.to_string()))?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/initialize-domain",
}]
async fn api_initialize_domain(
    rqctx: RequestContext<Arc<ApiContext>>,
    body: TypedBody<InitializeDomainParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    ctx.controller
        .initialize_domain(&ctx.core, body.into_inner())
        .await
        .map_err(http_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/initialize-node",
}]
async fn api_initialize_node(
    rqctx: RequestContext<Arc<ApiContext>>,
    body: TypedBody<InitializeNodeParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    ctx.controller
        .initialize_node(&ctx.core, body.into_inner())
        .await
        .map_err(http_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/csr-batch",
}]
async fn api_submit_csr_batch(
    rqctx: RequestContext<Arc<ApiContext>>,
    body: TypedBody<SignBatchRequest>,
) -> Result<HttpResponseOk<SignBatchResponse>, HttpError> {
    let ctx = rqctx.context();
    let request = body.into_inner();
    let request_id = request.request_id;
    let response = ctx
        .controller
        .sign_csr_batch(&ctx.core, request)
        .await
        .map_err(http_error)?;
    // Keep the correlated reply around: the submitter's bus semantics are
    // fire-and-wait, so it polls rather than trusting this response.
    ctx.replies.lock().await.insert(request_id, response.clone());
    Ok(HttpResponseOk(response))
}

#[derive(Deserialize, JsonSchema)]
struct BatchPathParams {
    request_id: Uuid,
}

#[endpoint {
    method = GET,
    path = "/csr-batch/{request_id}",
}]
async fn api_poll_csr_batch(
    rqctx: RequestContext<Arc<ApiContext>>,
    path_params: Path<BatchPathParams>,
) -> Result<HttpResponseOk<SignBatchResponse>, HttpError> {
    let ctx = rqctx.context();
    let request_id = path_params.into_inner().request_id;
    match ctx.replies.lock().await.get(&request_id) {
        Some(reply) => Ok(HttpResponseOk(reply.clone())),
        None => Err(HttpError::for_not_found(
            None,
            format!("no reply for request {}", request_id),
        )),
    }
}

#[endpoint {
    method = POST,
    path = "/routing",
}]
async fn api_register_routing(
    rqctx: RequestContext<Arc<ApiContext>>,
    body: TypedBody<RoutingRegistration>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    ctx.controller
        .accept_registration(&ctx.core, body.into_inner())
        .await
        .map_err(http_error)?;
    Ok(HttpResponseUpdatedNoContent())
}
