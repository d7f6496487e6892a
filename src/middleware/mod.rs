// Authentication, CORS, and debug logging middleware

pub mod debug;

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use tower_http::cors::{Any, CorsLayer};

use crate::auth_gate::{self, AuthContext};
use crate::error::ApiError;
use crate::routes::AppState;

pub use debug::debug_middleware;
pub use debug::DEBUG_LOGGER;

/// Authentication middleware
///
/// Resolves the presented key (Authorization/x-api-key header) against the
/// multi-tenant client-token store and attaches the resulting `AuthContext`
/// to the request for handlers to consume. Model-allowlist enforcement
/// happens in the handler once the request body (and its model) is parsed.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let authorization = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let x_api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let client_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    let presented = auth_gate::extract_key(authorization.as_deref(), x_api_key.as_deref())
        .ok_or_else(|| ApiError::AuthError("Invalid or missing API Key".to_string()))?;

    let ctx: AuthContext = auth_gate::authenticate(
        state.services.store.as_ref(),
        presented,
        None,
        client_ip.as_deref(),
    )
    .await?;

    let path = request.uri().path();
    let method = request.method();
    tracing::debug!("[{}] authenticated {} {}", ctx.user.id, method, path);

    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

/// Create CORS middleware layer
///
/// Configures CORS to allow all origins, methods, and headers.
/// Handles OPTIONS preflight requests automatically.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_gate::{generate_token, hash_token};
    use crate::services::Services;
    use crate::store::{ClientToken, MemoryStore, TokenStatus, User};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn create_test_state() -> AppState {
        AppState {
            services: Services::new_for_testing(),
        }
    }

    /// Builds an `AppState` whose store already has one active token/user
    /// seeded in it, plus a disabled-token builder for the negative test.
    fn state_with_token(status: TokenStatus) -> (AppState, String) {
        let store = Arc::new(MemoryStore::new());
        let (plaintext, hash) = generate_token().unwrap();
        store.insert_token(ClientToken {
            id: "t1".to_string(),
            user_id: "u1".to_string(),
            status,
            key_hash: hash,
            total_input_tokens: 0,
            total_output_tokens: 0,
            cross_group_retry: false,
            expires_at: None,
            ip_allowlist: None,
            model_allowlist: None,
        });
        store.insert_user(User {
            id: "u1".to_string(),
            name: "alice".to_string(),
            remaining_quota: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
        });
        let services = Services::new_for_testing_with_store(store);
        (AppState { services }, plaintext)
    }

    async fn test_handler() -> &'static str {
        "OK"
    }

    fn create_test_app(state: AppState) -> Router {
        Router::new()
            .route("/test", get(test_handler))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                auth_middleware,
            ))
            .with_state(state)
    }

    #[tokio::test]
    async fn test_auth_middleware_with_valid_bearer_token() {
        let (state, plaintext) = state_with_token(TokenStatus::Active);
        let app = create_test_app(state);

        let request = Request::builder()
            .uri("/test")
            .header("authorization", format!("Bearer {plaintext}"))
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_middleware_with_valid_x_api_key() {
        let (state, plaintext) = state_with_token(TokenStatus::Active);
        let app = create_test_app(state);

        let request = Request::builder()
            .uri("/test")
            .header("x-api-key", plaintext)
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_middleware_with_invalid_bearer_token() {
        let (state, _plaintext) = state_with_token(TokenStatus::Active);
        let app = create_test_app(state);

        let request = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer sk-prx-wrong")
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_auth_middleware_with_invalid_x_api_key() {
        let (state, _plaintext) = state_with_token(TokenStatus::Active);
        let app = create_test_app(state);

        let request = Request::builder()
            .uri("/test")
            .header("x-api-key", "sk-prx-wrong")
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_auth_middleware_with_missing_auth() {
        let state = create_test_state();
        let app = create_test_app(state);

        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_auth_middleware_bearer_without_prefix() {
        let (state, plaintext) = state_with_token(TokenStatus::Active);
        let app = create_test_app(state);

        // Missing "Bearer " prefix falls through to x-api-key, which isn't set either.
        let request = Request::builder()
            .uri("/test")
            .header("authorization", plaintext)
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_auth_middleware_rejects_disabled_token() {
        let (state, plaintext) = state_with_token(TokenStatus::Disabled);
        let app = create_test_app(state);

        let request = Request::builder()
            .uri("/test")
            .header("authorization", format!("Bearer {plaintext}"))
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_hash_token_is_deterministic() {
        assert_eq!(hash_token("sk-prx-abc"), hash_token("sk-prx-abc"));
    }

    // CORS middleware tests

    #[tokio::test]
    async fn test_cors_layer_allows_all_origins() {
        let state = create_test_state();
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(cors_layer())
            .with_state(state);

        // Create request with Origin header
        let request = Request::builder()
            .uri("/test")
            .header("origin", "https://example.com")
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();

        // Check that CORS headers are present
        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
        let allow_origin = response
            .headers()
            .get("access-control-allow-origin")
            .unwrap();
        assert_eq!(allow_origin, "*");
    }

    #[tokio::test]
    async fn test_cors_layer_handles_preflight_options() {
        let state = create_test_state();
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(cors_layer())
            .with_state(state);

        // Create OPTIONS preflight request
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/test")
            .header("origin", "https://example.com")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();

        // Check that preflight response has correct status
        assert_eq!(response.status(), StatusCode::OK);

        // Check CORS headers
        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
        assert!(response
            .headers()
            .contains_key("access-control-allow-methods"));
        assert!(response
            .headers()
            .contains_key("access-control-allow-headers"));
    }

    #[tokio::test]
    async fn test_cors_layer_allows_all_methods() {
        let state = create_test_state();
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(cors_layer())
            .with_state(state);

        // Create OPTIONS request asking for POST method
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/test")
            .header("origin", "https://example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();

        // Check that all methods are allowed
        assert!(response
            .headers()
            .contains_key("access-control-allow-methods"));
        let allow_methods = response
            .headers()
            .get("access-control-allow-methods")
            .unwrap();
        let methods_str = allow_methods.to_str().unwrap();

        // tower-http returns "*" for Any
        assert_eq!(methods_str, "*");
    }

    #[tokio::test]
    async fn test_cors_layer_allows_all_headers() {
        let state = create_test_state();
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(cors_layer())
            .with_state(state);

        // Create OPTIONS request asking for custom headers
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/test")
            .header("origin", "https://example.com")
            .header("access-control-request-method", "POST")
            .header(
                "access-control-request-headers",
                "x-custom-header, authorization",
            )
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();

        // Check that all headers are allowed
        assert!(response
            .headers()
            .contains_key("access-control-allow-headers"));
        let allow_headers = response
            .headers()
            .get("access-control-allow-headers")
            .unwrap();
        let headers_str = allow_headers.to_str().unwrap();

        // tower-http returns "*" for Any
        assert_eq!(headers_str, "*");
    }

    #[tokio::test]
    async fn test_cors_layer_with_different_origins() {
        let state = create_test_state();
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(cors_layer())
            .with_state(state);

        // Test with different origins
        let origins = vec![
            "https://example.com",
            "http://localhost:3000",
            "https://app.example.org",
        ];

        for origin in origins {
            let request = Request::builder()
                .uri("/test")
                .header("origin", origin)
                .body(Body::empty())
                .unwrap();

            let response = app.clone().oneshot(request).await.unwrap();

            // All origins should be allowed
            assert!(response
                .headers()
                .contains_key("access-control-allow-origin"));
            let allow_origin = response
                .headers()
                .get("access-control-allow-origin")
                .unwrap();
            assert_eq!(allow_origin, "*");
        }
    }
}
