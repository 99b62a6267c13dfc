use crate::{
    data::models::{LoggedUser, Pool},
    errors::ServiceError,
    operators::{
        token_operator::{decode_token, get_user_from_tool_token_query, TokenKind},
        user_operator::get_user_by_id_query,
    },
};
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::HeaderMap,
    web, Error, HttpMessage,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    rc::Rc,
};

pub struct AuthenticationMiddleware<S> {
    service: Rc<S>,
}

fn get_bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    let auth_header_value = headers.get("Authorization")?.to_str().ok()?;
    if let Some(stripped) = auth_header_value.strip_prefix("Bearer ") {
        Some(stripped.to_string())
    } else {
        Some(auth_header_value.to_string())
    }
}

/// Resolves the bearer credential to a user. Both signed session tokens and
/// persisted tool tokens yield the same caller context.
fn resolve_user(token: &str, pool: web::Data<Pool>) -> Result<LoggedUser, ServiceError> {
    if token.starts_with("dbt-") {
        let user = get_user_from_tool_token_query(token, pool)?;
        return Ok(LoggedUser::from(user));
    }

    let claims = decode_token(token)?;
    if claims.kind == TokenKind::Refresh {
        return Err(ServiceError::Unauthorized);
    }

    let user_id = claims
        .sub
        .parse::<uuid::Uuid>()
        .map_err(|_| ServiceError::Unauthorized)?;

    // Roles and active flag are read fresh so revocation takes effect
    // before the token expires.
    let user = get_user_by_id_query(user_id, pool).map_err(|_| ServiceError::Unauthorized)?;
    if !user.is_active {
        return Err(ServiceError::Unauthorized);
    }

    Ok(LoggedUser::from(user))
}

impl<S, B> Service<ServiceRequest> for AuthenticationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let srv = self.service.clone();
        Box::pin(async move {
            if let Some(token) = get_bearer_from_headers(req.headers()) {
                let pool = req
                    .app_data::<web::Data<Pool>>()
                    .expect("Pool should be registered")
                    .to_owned();

                let user = web::block(move || resolve_user(&token, pool))
                    .await
                    .map_err(|_| {
                        Into::<Error>::into(ServiceError::InternalServerError(
                            "Auth lookup failed".to_string(),
                        ))
                    })??;

                req.extensions_mut().insert(user);
            }

            let res = srv.call(req).await?;
            Ok(res)
        })
    }
}

pub struct AuthMiddlewareFactory;

impl<S, B> Transform<S, ServiceRequest> for AuthMiddlewareFactory
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthenticationMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthenticationMiddleware {
            service: Rc::new(service),
        }))
    }
}
