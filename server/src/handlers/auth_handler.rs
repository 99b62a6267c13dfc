use crate::{
    data::models::{LoggedUser, Organization, Pool, User},
    errors::{ErrorResponseBody, ServiceError},
    operators::{
        organization_operator::{
            create_organization_query, get_organization_by_id_query,
            get_organization_by_name_query,
        },
        token_operator::{
            create_tool_token_query, issue_token_pair, revoke_tool_token_query,
            rotate_refresh_token, TokenPair,
        },
        user_operator::{
            authenticate_user_query, create_user_query, get_user_by_id_query, hash_password,
        },
    },
};
use actix_web::{dev::Payload, web, FromRequest, HttpMessage, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};
use utoipa::ToSchema;

impl FromRequest for LoggedUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<LoggedUser, actix_web::Error>>;

    #[inline]
    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<LoggedUser>()
                .cloned()
                .ok_or(ServiceError::Unauthorized.into()),
        )
    }
}

/// Extractor for superuser-gated routes.
#[derive(Debug, Clone)]
pub struct SuperuserOnly(pub LoggedUser);

impl FromRequest for SuperuserOnly {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, actix_web::Error>>;

    #[inline]
    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let user = req.extensions().get::<LoggedUser>().cloned();
        ready(match user {
            Some(user) if user.is_superuser => Ok(SuperuserOnly(user)),
            Some(_) => Err(ServiceError::Forbidden.into()),
            None => Err(ServiceError::Unauthorized.into()),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginReqPayload {
    pub username: String,
    pub password: String,
}

/// Login
///
/// Exchanges username and password for an access/refresh token pair.
#[utoipa::path(
    post,
    path = "/auth/login",
    tag = "Auth",
    request_body(content = LoginReqPayload, content_type = "application/json"),
    responses(
        (status = 200, description = "Token pair for the authenticated user"),
        (status = 401, description = "Unknown user or wrong password", body = ErrorResponseBody),
    ),
)]
pub async fn login(
    payload: web::Json<LoginReqPayload>,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let payload = payload.into_inner();

    let pair: TokenPair = web::block(move || {
        let user = authenticate_user_query(&payload.username, &payload.password, pool.clone())?;
        issue_token_pair(&user, pool)
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::Ok().json(pair))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RefreshReqPayload {
    pub refresh_token: String,
}

/// Refresh
///
/// Rotates a single-use refresh token into a fresh token pair.
#[utoipa::path(
    post,
    path = "/auth/refresh",
    tag = "Auth",
    request_body(content = RefreshReqPayload, content_type = "application/json"),
    responses(
        (status = 200, description = "New token pair"),
        (status = 401, description = "Expired, revoked or malformed refresh token", body = ErrorResponseBody),
    ),
)]
pub async fn refresh(
    payload: web::Json<RefreshReqPayload>,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let payload = payload.into_inner();

    let pair = web::block(move || {
        let user_id = rotate_refresh_token(&payload.refresh_token, pool.clone())?;
        let user = get_user_by_id_query(user_id, pool.clone())?;

        if !user.is_active {
            return Err(ServiceError::Unauthorized);
        }

        issue_token_pair(&user, pool)
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::Ok().json(pair))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegisterReqPayload {
    pub username: String,
    pub email: String,
    pub password: String,
    /// Existing organization to join.
    pub organization_id: Option<uuid::Uuid>,
    /// Organization name to join or create when no id is given.
    pub organization: Option<String>,
}

/// Register
///
/// Creates a new account with the default viewer role.
#[utoipa::path(
    post,
    path = "/auth/register",
    tag = "Auth",
    request_body(content = RegisterReqPayload, content_type = "application/json"),
    responses(
        (status = 201, description = "Created user profile"),
        (status = 400, description = "Invalid registration data", body = ErrorResponseBody),
        (status = 409, description = "Username or email already taken", body = ErrorResponseBody),
    ),
)]
pub async fn register(
    payload: web::Json<RegisterReqPayload>,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let payload = payload.into_inner();

    if payload.username.trim().is_empty() || !payload.email.contains('@') {
        return Err(ServiceError::BadRequest("Invalid username or email".to_string()).into());
    }
    if payload.password.chars().count() < 8 {
        return Err(
            ServiceError::BadRequest("Password must be at least 8 characters".to_string()).into(),
        );
    }

    let user = web::block(move || {
        let org_id = match (payload.organization_id, payload.organization.as_deref()) {
            (Some(org_id), _) => Some(get_organization_by_id_query(org_id, pool.clone())?.id),
            (None, Some(name)) if !name.trim().is_empty() => {
                let org = match get_organization_by_name_query(name.trim(), pool.clone())? {
                    Some(org) => org,
                    None => create_organization_query(
                        Organization::from_details(name.trim(), ""),
                        pool.clone(),
                    )?,
                };
                Some(org.id)
            }
            _ => None,
        };

        let hash = hash_password(&payload.password)?;
        create_user_query(
            User::from_details(
                payload.username.trim().to_string(),
                payload.email.trim().to_string(),
                hash,
                org_id,
            ),
            pool,
        )
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::Created().json(LoggedUser::from(user)))
}

/// Current user
#[utoipa::path(
    get,
    path = "/auth/me",
    tag = "Auth",
    responses(
        (status = 200, description = "Profile of the calling user", body = LoggedUser),
        (status = 401, description = "Missing or invalid token", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn me(user: LoggedUser) -> Result<HttpResponse, actix_web::Error> {
    Ok(HttpResponse::Ok().json(user))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateToolTokenReqPayload {
    pub name: String,
    pub expires_at: Option<chrono::NaiveDateTime>,
}

/// Create tool token
///
/// Mints a long-lived revocable credential for external AI assistants. The
/// raw secret is returned exactly once.
#[utoipa::path(
    post,
    path = "/auth/tool_tokens",
    tag = "Auth",
    request_body(content = CreateToolTokenReqPayload, content_type = "application/json"),
    responses(
        (status = 201, description = "Token metadata plus the one-time secret"),
        (status = 401, description = "Missing or invalid token", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn create_tool_token(
    payload: web::Json<CreateToolTokenReqPayload>,
    user: LoggedUser,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let payload = payload.into_inner();

    let (token, raw_secret) =
        web::block(move || create_tool_token_query(user.id, &payload.name, payload.expires_at, pool))
            .await
            .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::Created().json(serde_json::json!({
        "id": token.id,
        "name": token.name,
        "created_at": token.created_at,
        "expires_at": token.expires_at,
        "secret": raw_secret,
    })))
}

/// Revoke tool token
#[utoipa::path(
    delete,
    path = "/auth/tool_tokens/{token_id}",
    tag = "Auth",
    params(("token_id" = uuid::Uuid, Path, description = "Tool token to revoke")),
    responses(
        (status = 204, description = "Token deactivated"),
        (status = 404, description = "No such token for this user", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn revoke_tool_token(
    token_id: web::Path<uuid::Uuid>,
    user: LoggedUser,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let token_id = token_id.into_inner();

    web::block(move || revoke_tool_token_query(token_id, user.id, pool))
        .await
        .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::NoContent().finish())
}
