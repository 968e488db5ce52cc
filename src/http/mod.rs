use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Extension, FromRequest, Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{get, put},
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    binding::{BindOutcome, BindingError, BindingLifecycle},
    catalog::{CatalogDocument, build_catalog},
    config::Config,
    dispenser::{Dispenser, DispenserError},
    instance::{
        DeprovisionOutcome, InstanceLifecycle, LastOperation, LifecycleError, ProvisionOutcome,
        ProvisionRequest,
    },
    store::BrokerStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Mutex<BrokerStore>>,
    pub catalog: Arc<CatalogDocument>,
    pub instances: InstanceLifecycle,
    pub bindings: BindingLifecycle,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    description: String,
    status: StatusCode,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            status,
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, description)
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, description)
    }

    pub fn unauthorized(description: impl Into<String>) -> Self {
        Self::new("unauthorized", StatusCode::UNAUTHORIZED, description)
    }

    pub fn conflict(description: impl Into<String>) -> Self {
        Self::new("conflict", StatusCode::CONFLICT, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, description)
    }

    fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl From<LifecycleError> for ApiError {
    fn from(value: LifecycleError) -> Self {
        let description = value.to_string();
        match value {
            LifecycleError::NotFound { .. } => ApiError::not_found(description),
            LifecycleError::Conflict { .. } => ApiError::conflict(description),
            LifecycleError::InvalidState { .. } => ApiError::new(
                "invalid_state",
                StatusCode::UNPROCESSABLE_ENTITY,
                description,
            ),
            LifecycleError::BindingsExist { .. } => {
                ApiError::new("bindings_present", StatusCode::CONFLICT, description)
            }
            LifecycleError::Dispenser(DispenserError::Unavailable { .. }) => {
                ApiError::new("dispenser_unavailable", StatusCode::BAD_GATEWAY, description)
            }
            LifecycleError::Dispenser(DispenserError::Rejected { .. }) => {
                ApiError::new("dispenser_rejected", StatusCode::BAD_GATEWAY, description)
            }
            LifecycleError::Store(_) => ApiError::internal(description),
        }
    }
}

impl From<BindingError> for ApiError {
    fn from(value: BindingError) -> Self {
        let description = value.to_string();
        match value {
            BindingError::InstanceNotFound { .. } | BindingError::NotFound { .. } => {
                ApiError::not_found(description)
            }
            BindingError::InstanceNotReady { .. } => {
                ApiError::new("instance_not_ready", StatusCode::CONFLICT, description)
            }
            BindingError::Conflict { .. } => ApiError::conflict(description),
            BindingError::Store(_) => ApiError::internal(description),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    description: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.code.to_string(),
            description: self.description,
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

pub fn build_router(
    config: Config,
    store: Arc<Mutex<BrokerStore>>,
    dispenser: Arc<dyn Dispenser>,
) -> Router {
    let auth_state = BrokerAuthState {
        username: config.broker_username.clone(),
        password: config.broker_password.clone(),
    };
    if !config.basic_auth_enabled() {
        warn!("no broker credentials configured, /v2 endpoints accept unauthenticated requests");
    }

    let catalog = build_catalog(&config);
    let app_state = AppState {
        config: Arc::new(config),
        store: store.clone(),
        catalog: Arc::new(catalog),
        instances: InstanceLifecycle::new(store.clone(), dispenser),
        bindings: BindingLifecycle::new(store),
    };

    let broker = Router::new()
        .route("/catalog", get(get_catalog))
        .route(
            "/service_instances/:instance_id",
            put(put_service_instance)
                .patch(patch_service_instance)
                .delete(delete_service_instance),
        )
        .route(
            "/service_instances/:instance_id/last_operation",
            get(get_last_operation),
        )
        .route(
            "/service_instances/:instance_id/service_bindings/:binding_id",
            put(put_service_binding).delete(delete_service_binding),
        )
        .layer(middleware::from_fn_with_state(auth_state, broker_auth));

    Router::new()
        .nest("/v2", broker)
        .route("/health", get(health))
        .route("/dashboard/:instance_id", get(get_dashboard))
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

async fn broker_auth(
    State(auth): State<BrokerAuthState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if auth.username.is_empty() {
        return next.run(req).await;
    }

    let Some((username, password)) = extract_basic_credentials(req.headers()) else {
        return unauthorized_basic();
    };
    if username == auth.username && password == auth.password {
        return next.run(req).await;
    }

    unauthorized_basic()
}

fn unauthorized_basic() -> Response {
    let mut response = ApiError::unauthorized("missing or invalid credentials").into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"haas-broker\""),
    );
    response
}

fn extract_basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get(header::AUTHORIZATION)?;
    let raw = raw.to_str().ok()?;
    let raw = raw.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(raw).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[derive(Clone)]
struct BrokerAuthState {
    username: String,
    password: String,
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::version::VERSION,
    }))
}

async fn get_catalog(Extension(state): Extension<AppState>) -> Json<CatalogDocument> {
    Json(state.catalog.as_ref().clone())
}

#[derive(Debug, Deserialize)]
struct ProvisionBody {
    service_id: String,
    plan_id: String,
    organization_guid: String,
    space_guid: String,
    #[serde(default)]
    parameters: Option<Value>,
}

async fn put_service_instance(
    Extension(state): Extension<AppState>,
    Path(instance_id): Path<String>,
    ApiJson(body): ApiJson<ProvisionBody>,
) -> Result<Response, ApiError> {
    validate_service_id(&state, &body.service_id)?;
    validate_plan_id(&state, &body.plan_id)?;

    let request = ProvisionRequest {
        plan_id: body.plan_id,
        organization_id: body.organization_guid,
        space_id: body.space_guid,
        parameters: body.parameters.unwrap_or_else(|| json!({})),
    };
    match state.instances.provision(&instance_id, request).await? {
        ProvisionOutcome::Accepted { .. } | ProvisionOutcome::Unchanged => {
            Ok((StatusCode::ACCEPTED, Json(json!({}))).into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    #[serde(default)]
    service_id: Option<String>,
    #[serde(default)]
    plan_id: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
}

async fn patch_service_instance(
    Extension(state): Extension<AppState>,
    Path(instance_id): Path<String>,
    ApiJson(body): ApiJson<UpdateBody>,
) -> Result<Response, ApiError> {
    if let Some(service_id) = &body.service_id {
        validate_service_id(&state, service_id)?;
    }
    if let Some(plan_id) = &body.plan_id
        && plan_id != &state.config.plan_id
    {
        return Err(ApiError::invalid_request(format!(
            "plan changes are not supported: {plan_id}"
        )));
    }

    let parameters = body.parameters.unwrap_or_else(|| json!({}));
    state.instances.update(&instance_id, parameters).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({}))).into_response())
}

async fn delete_service_instance(
    Extension(state): Extension<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.instances.deprovision(&instance_id).await {
        Ok(DeprovisionOutcome::Accepted { .. } | DeprovisionOutcome::Unchanged) => {
            Ok((StatusCode::ACCEPTED, Json(json!({}))).into_response())
        }
        Ok(DeprovisionOutcome::Released) => Ok((StatusCode::OK, Json(json!({}))).into_response()),
        Err(LifecycleError::NotFound { .. }) => Ok(gone()),
        Err(err @ LifecycleError::InvalidState { .. }) => {
            Err(ApiError::from(err).with_status(StatusCode::CONFLICT))
        }
        Err(err) => Err(err.into()),
    }
}

async fn get_last_operation(
    Extension(state): Extension<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<LastOperation>, ApiError> {
    let operation = state.instances.last_operation(&instance_id).await?;
    Ok(Json(operation))
}

#[derive(Debug, Deserialize)]
struct BindBody {
    #[serde(default)]
    parameters: Option<Value>,
}

async fn put_service_binding(
    Extension(state): Extension<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    ApiJson(body): ApiJson<BindBody>,
) -> Result<Response, ApiError> {
    let parameters = body.parameters.unwrap_or_else(|| json!({}));
    match state
        .bindings
        .bind(&instance_id, &binding_id, parameters)
        .await?
    {
        BindOutcome::Created(binding) => Ok((
            StatusCode::CREATED,
            Json(json!({ "credentials": binding.credentials })),
        )
            .into_response()),
        BindOutcome::Unchanged(binding) => Ok((
            StatusCode::OK,
            Json(json!({ "credentials": binding.credentials })),
        )
            .into_response()),
    }
}

async fn delete_service_binding(
    Extension(state): Extension<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    match state.bindings.unbind(&instance_id, &binding_id).await {
        Ok(()) => Ok((StatusCode::OK, Json(json!({}))).into_response()),
        Err(BindingError::NotFound { .. }) => Ok(gone()),
        Err(err) => Err(err.into()),
    }
}

async fn get_dashboard(
    Extension(state): Extension<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Redirect, ApiError> {
    let instance = {
        let store = state.store.lock().await;
        store.get_instance(&instance_id)
    };
    let instance = instance
        .ok_or_else(|| ApiError::not_found(format!("service instance not found: {instance_id}")))?;

    let location = instance
        .dashboard_url
        .unwrap_or_else(|| state.config.dashboard_url.clone());
    if location.is_empty() {
        return Err(ApiError::not_found(format!(
            "no dashboard for service instance: {instance_id}"
        )));
    }
    Ok(Redirect::temporary(&location))
}

fn gone() -> Response {
    (StatusCode::GONE, Json(json!({}))).into_response()
}

fn validate_service_id(state: &AppState, service_id: &str) -> Result<(), ApiError> {
    if service_id != state.config.service_id {
        return Err(ApiError::invalid_request(format!(
            "unknown service_id: {service_id}"
        )));
    }
    Ok(())
}

fn validate_plan_id(state: &AppState, plan_id: &str) -> Result<(), ApiError> {
    if plan_id != state.config.plan_id {
        return Err(ApiError::invalid_request(format!(
            "unknown plan_id: {plan_id}"
        )));
    }
    Ok(())
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("route not found")
}
