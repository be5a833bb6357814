//! `lmserve serve` — HTTP text-generation server.
//!
//! Endpoints:
//!   POST /generate
//!   GET  /health

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use lmserve_core::{
    default_device, load_model, parse_dtype, ChatRequest, ChatTemplate, GenerateOutput, Model,
    RequestError, SamplingParams, TokenizerWrapper,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{GenerationArgs, ModelArgs};

// ---------------------------------------------------------------------------
// Shared server state
// ---------------------------------------------------------------------------

pub struct ServerState {
    model: Mutex<Box<dyn Model>>,
    tokenizer: TokenizerWrapper,
    params: SamplingParams,
    template: ChatTemplate,
    default_system: Option<String>,
    model_id: String,
}

impl ServerState {
    pub fn new(
        model: Box<dyn Model>,
        tokenizer: TokenizerWrapper,
        params: SamplingParams,
        template: ChatTemplate,
        default_system: Option<String>,
        model_id: String,
    ) -> Self {
        Self {
            model: Mutex::new(model),
            tokenizer,
            params,
            template,
            default_system,
            model_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GenerateResponse {
    generated_text: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Error)]
enum ApiError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("{0}")]
    BadRequest(String),
    #[error("generation failed: {0:#}")]
    Generation(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Request(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry point
// ---------------------------------------------------------------------------

pub async fn execute(
    model_args: &ModelArgs,
    generation: &GenerationArgs,
    host: &str,
    port: u16,
) -> Result<()> {
    let source = model_args.source();
    let dtype = parse_dtype(&model_args.dtype)?;
    let device = default_device()?;
    tracing::info!(%source, ?dtype, "loading model");

    // Hub downloads and weight loading block.
    let (files, model, tokenizer) = tokio::task::spawn_blocking({
        let source = source.clone();
        move || -> Result<_> {
            let files = source.resolve()?;
            let (model, tokenizer) = load_model(&files, &device, dtype)?;
            Ok((files, model, tokenizer))
        }
    })
    .await??;

    let params = generation.sampling_params(&files)?;
    tracing::info!(
        template = %generation.template,
        max_new_tokens = params.max_new_tokens,
        temperature = params.temperature,
        top_p = params.top_p,
        top_k = params.top_k,
        "sampling defaults"
    );

    let state = Arc::new(ServerState::new(
        model,
        tokenizer,
        params,
        generation.template,
        generation.default_system_prompt.clone(),
        source.model_id(),
    ));

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "lmserve listening");
    tracing::info!("  POST /generate");
    tracing::info!("  GET  /health");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/generate", post(handle_generate))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.model_id.clone(),
    })
}

async fn handle_generate(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let request = ChatRequest::from_value(body).inspect_err(|e| {
        tracing::warn!(error = %e, "rejected request body");
    })?;

    let params = state.params.apply(&request.overrides);
    params
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let prompt = state
        .template
        .render(&request.messages, state.default_system.as_deref());
    tracing::info!(
        messages = request.messages.len(),
        max_new_tokens = params.max_new_tokens,
        "generate request"
    );

    let output = generate_blocking(state.clone(), prompt, params)
        .await
        .map_err(|e| {
            tracing::error!(error = %format!("{e:#}"), "generation failed");
            ApiError::Generation(e)
        })?;

    tracing::info!(
        prompt_tokens = output.prompt_tokens,
        generated_tokens = output.generated_tokens,
        finish_reason = ?output.finish_reason,
        "generation complete"
    );

    Ok(Json(GenerateResponse {
        generated_text: output.text,
    }))
}

// ---------------------------------------------------------------------------
// Blocking generation
// ---------------------------------------------------------------------------

/// Generate on a blocking thread; the model is shared behind a mutex.
async fn generate_blocking(
    state: Arc<ServerState>,
    prompt: String,
    params: SamplingParams,
) -> Result<GenerateOutput> {
    let (tx, rx) = oneshot::channel();

    tokio::task::spawn_blocking(move || {
        let result = generate_sync(&state, &prompt, params);
        let _ = tx.send(result);
    });

    rx.await.map_err(|_| anyhow::anyhow!("generation task panicked"))?
}

fn generate_sync(state: &ServerState, prompt: &str, params: SamplingParams) -> Result<GenerateOutput> {
    // A panic in an earlier request poisons the lock; the KV cache is
    // cleared before every generation, so the model is still usable.
    let mut model = state.model.lock().unwrap_or_else(PoisonError::into_inner);
    lmserve_core::generate_text(&mut **model, &state.tokenizer, prompt, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use candle_core::{Device, Tensor};
    use tower::ServiceExt;

    const TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<|im_end|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "<|im_start|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<|im_end|>": 0, "<|im_start|>": 1, "[UNK]": 2, "hello": 3, "world": 4},
            "unk_token": "[UNK]"
        }
    }"#;

    /// Emits `hello world <|im_end|>`, or fails every forward pass.
    struct EchoModel {
        step: usize,
        fail: bool,
        device: Device,
    }

    impl Model for EchoModel {
        fn forward(&mut self, _input_ids: &Tensor, _position: usize) -> Result<Tensor> {
            if self.fail {
                anyhow::bail!("device out of memory");
            }
            let target = [3usize, 4, 0].get(self.step).copied().unwrap_or(0);
            self.step += 1;
            let mut logits = vec![0.0f32; 5];
            logits[target] = 10.0;
            Ok(Tensor::new(logits, &self.device)?.reshape((1, 1, 5))?)
        }

        fn reset(&mut self) {
            self.step = 0;
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn max_seq_len(&self) -> usize {
            512
        }
    }

    /// Panics on its first forward pass, then behaves like [`EchoModel`].
    struct PanicOnceModel {
        panicked: bool,
        inner: EchoModel,
    }

    impl Model for PanicOnceModel {
        fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor> {
            if !self.panicked {
                self.panicked = true;
                panic!("kernel crashed");
            }
            self.inner.forward(input_ids, position)
        }

        fn reset(&mut self) {
            self.inner.reset();
        }

        fn device(&self) -> &Device {
            self.inner.device()
        }

        fn max_seq_len(&self) -> usize {
            self.inner.max_seq_len()
        }
    }

    fn echo(fail: bool) -> EchoModel {
        EchoModel {
            step: 0,
            fail,
            device: Device::Cpu,
        }
    }

    fn app(fail: bool) -> Router {
        app_with(Box::new(echo(fail)))
    }

    fn app_with(model: Box<dyn Model>) -> Router {
        let params = SamplingParams {
            temperature: 0.0,
            ..Default::default()
        };
        let state = ServerState::new(
            model,
            TokenizerWrapper::from_bytes(TOKENIZER.as_bytes()).unwrap(),
            params,
            ChatTemplate::ChatMl,
            None,
            "test-model".into(),
        );
        router(Arc::new(state))
    }

    async fn post(app: Router, body: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/generate")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn bare_array_generates() {
        let (status, json) = post(app(false), r#"[{"role": "user", "content": "hello"}]"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!({"generated_text": "hello world"}));
    }

    #[tokio::test]
    async fn messages_object_generates() {
        let body = r#"{"messages": [{"role": "system", "content": "x"}, {"role": "user", "content": "hello"}]}"#;
        let (status, json) = post(app(false), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["generated_text"], "hello world");
    }

    #[tokio::test]
    async fn token_budget_override() {
        let body = r#"{"messages": [{"role": "user", "content": "hello"}], "max_new_tokens": 1}"#;
        let (status, json) = post(app(false), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["generated_text"], "hello");
    }

    #[tokio::test]
    async fn unsupported_shape_is_bad_request() {
        let (status, json) = post(app(false), r#""just a string""#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("unsupported input"));
    }

    #[tokio::test]
    async fn invalid_override_is_bad_request() {
        let body = r#"{"messages": [{"role": "user", "content": "hello"}], "top_p": 3.0}"#;
        let (status, json) = post(app(false), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("top_p"));
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let (status, _) = post(app(false), "[{").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn generation_failure_is_server_error() {
        let (status, json) = post(app(true), r#"[{"role": "user", "content": "hello"}]"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].as_str().unwrap().contains("out of memory"));
    }

    #[tokio::test]
    async fn recovers_after_generation_panic() {
        let app = app_with(Box::new(PanicOnceModel {
            panicked: false,
            inner: echo(false),
        }));
        let body = r#"[{"role": "user", "content": "hello"}]"#;

        let (status, json) = post(app.clone(), body).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].as_str().unwrap().contains("panicked"));

        for _ in 0..2 {
            let (status, json) = post(app.clone(), body).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["generated_text"], "hello world");
        }
    }

    #[tokio::test]
    async fn health_reports_model() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app(false).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok", "model": "test-model"}));
    }
}
