use crate::{auth::jwt::JwtAccessTokenService, error::ChatError};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use parley_common::protocol::error::ErrorKind;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
}

pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let user_id = match jwt_service.validate_access_token(token) {
        Ok(user_id) => user_id,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    request.extensions_mut().insert(AuthenticatedUser { user_id });

    next.run(request).await
}

pub(crate) fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    ChatError::new(ErrorKind::Unauthorized, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::{extract_bearer_token, require_bearer_auth, AuthenticatedUser};
    use crate::auth::jwt::JwtAccessTokenService;
    use axum::{
        body::Body,
        extract::Extension,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_SECRET: &str = "parley_test_secret_that_is_definitely_long_enough";

    fn protected_app(jwt_service: Arc<JwtAccessTokenService>) -> Router {
        Router::new()
            .route(
                "/protected",
                get(|Extension(user): Extension<AuthenticatedUser>| async move {
                    user.user_id.to_string()
                }),
            )
            .layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
    }

    fn jwt() -> Arc<JwtAccessTokenService> {
        Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"))
    }

    async fn status_for(app: Router, authorization: Option<String>) -> StatusCode {
        let mut builder = Request::builder().uri("/protected");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        app.oneshot(builder.body(Body::empty()).expect("request should build"))
            .await
            .expect("request should return a response")
            .status()
    }

    #[tokio::test]
    async fn rejects_missing_and_invalid_tokens() {
        assert_eq!(status_for(protected_app(jwt()), None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(protected_app(jwt()), Some("Bearer invalid-token".into())).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn injects_authenticated_user_for_valid_token() {
        let service = jwt();
        let token = service.issue_access_token(Uuid::new_v4()).expect("token should be issued");

        let status = status_for(protected_app(service), Some(format!("Bearer {token}"))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn bearer_scheme_is_case_insensitive_and_requires_a_token() {
        assert_eq!(extract_bearer_token("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Bearer   "), None);
        assert_eq!(extract_bearer_token("Basic abc"), None);
    }
}
