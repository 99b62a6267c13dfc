use crate::{
    data::models::{LoggedUser, Pool, RefreshToken, ToolToken, User},
    errors::ServiceError,
    get_env,
    operators::user_operator::{generate_secret, hash_password},
};
use actix_web::web;
use diesel::prelude::*;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const ACCESS_TOKEN_TTL_SECS: i64 = 60 * 60;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
    Tool,
}

/// Signed bearer claims. The same shape is used for access and refresh
/// tokens; refresh tokens additionally carry a `jti` tracked server-side so
/// rotation is single-use.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub org_id: Option<uuid::Uuid>,
    pub is_superuser: bool,
    pub roles: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub kind: TokenKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<uuid::Uuid>,
}

fn jwt_secret() -> &'static str {
    get_env!("JWT_SECRET", "JWT_SECRET should be set")
}

pub fn mint_claims(user: &User, kind: TokenKind, ttl_secs: i64, jti: Option<uuid::Uuid>) -> Claims {
    let now = chrono::Utc::now().timestamp();
    Claims {
        sub: user.id.to_string(),
        username: user.username.clone(),
        org_id: user.org_id,
        is_superuser: user.is_superuser,
        roles: user.role_codes.clone(),
        iat: now,
        exp: now + ttl_secs,
        kind,
        jti,
    }
}

pub fn encode_token(claims: &Claims) -> Result<String, ServiceError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(jwt_secret().as_bytes()),
    )
    .map_err(|_| ServiceError::InternalServerError("Could not sign token".to_string()))
}

pub fn decode_token(token: &str) -> Result<Claims, ServiceError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret().as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ServiceError::Unauthorized)?;

    Ok(data.claims)
}

pub fn logged_user_from_claims(claims: &Claims) -> Result<LoggedUser, ServiceError> {
    let id = claims
        .sub
        .parse::<uuid::Uuid>()
        .map_err(|_| ServiceError::Unauthorized)?;

    Ok(LoggedUser {
        id,
        username: claims.username.clone(),
        email: String::new(),
        org_id: claims.org_id,
        is_superuser: claims.is_superuser,
        roles: claims.roles.clone(),
    })
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Mints an access/refresh pair and records the refresh jti for rotation.
pub fn issue_token_pair(user: &User, pool: web::Data<Pool>) -> Result<TokenPair, ServiceError> {
    use crate::data::schema::refresh_tokens::dsl as refresh_columns;

    let jti = uuid::Uuid::new_v4();
    let access = encode_token(&mint_claims(user, TokenKind::Access, ACCESS_TOKEN_TTL_SECS, None))?;
    let refresh = encode_token(&mint_claims(
        user,
        TokenKind::Refresh,
        REFRESH_TOKEN_TTL_SECS,
        Some(jti),
    ))?;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let row = RefreshToken {
        id: jti,
        user_id: user.id,
        expires_at: chrono::Utc::now().naive_utc()
            + chrono::Duration::seconds(REFRESH_TOKEN_TTL_SECS),
        revoked: false,
        created_at: chrono::Utc::now().naive_utc(),
    };

    diesel::insert_into(refresh_columns::refresh_tokens)
        .values(&row)
        .execute(&mut conn)?;

    Ok(TokenPair {
        access_token: access,
        refresh_token: refresh,
        expires_in: ACCESS_TOKEN_TTL_SECS,
    })
}

/// Validates a refresh token and rotates it. The presented jti is revoked in
/// the same step, making each refresh token single-use.
pub fn rotate_refresh_token(
    refresh_token: &str,
    pool: web::Data<Pool>,
) -> Result<uuid::Uuid, ServiceError> {
    use crate::data::schema::refresh_tokens::dsl as refresh_columns;

    let claims = decode_token(refresh_token)?;
    if claims.kind != TokenKind::Refresh {
        return Err(ServiceError::Unauthorized);
    }
    let jti = claims.jti.ok_or(ServiceError::Unauthorized)?;
    let user_id = claims
        .sub
        .parse::<uuid::Uuid>()
        .map_err(|_| ServiceError::Unauthorized)?;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let updated = diesel::update(
        refresh_columns::refresh_tokens
            .filter(refresh_columns::id.eq(jti))
            .filter(refresh_columns::user_id.eq(user_id))
            .filter(refresh_columns::revoked.eq(false))
            .filter(refresh_columns::expires_at.gt(chrono::Utc::now().naive_utc())),
    )
    .set(refresh_columns::revoked.eq(true))
    .execute(&mut conn)?;

    if updated == 0 {
        return Err(ServiceError::Unauthorized);
    }

    Ok(user_id)
}

/// Creates a persisted tool token; the raw secret is returned exactly once.
pub fn create_tool_token_query(
    owner_id: uuid::Uuid,
    name: &str,
    expires_at: Option<chrono::NaiveDateTime>,
    pool: web::Data<Pool>,
) -> Result<(ToolToken, String), ServiceError> {
    use crate::data::schema::tool_tokens::dsl as tool_tokens_columns;

    let raw_secret = format!("dbt-{}", generate_secret());
    let secret_hash = hash_password(&raw_secret)?;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let token: ToolToken = diesel::insert_into(tool_tokens_columns::tool_tokens)
        .values(ToolToken::from_details(
            owner_id,
            name.to_string(),
            secret_hash,
            expires_at,
        ))
        .get_result(&mut conn)?;

    Ok((token, raw_secret))
}

/// Resolves a presented tool secret to its owner, enforcing `active` and
/// expiry and stamping `last_used`.
pub fn get_user_from_tool_token_query(
    raw_secret: &str,
    pool: web::Data<Pool>,
) -> Result<User, ServiceError> {
    use crate::data::schema::tool_tokens::dsl as tool_tokens_columns;
    use crate::data::schema::users::dsl as users_columns;

    let secret_hash = hash_password(raw_secret)?;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let token: Option<ToolToken> = tool_tokens_columns::tool_tokens
        .filter(tool_tokens_columns::secret_hash.eq(secret_hash))
        .filter(tool_tokens_columns::active.eq(true))
        .select(ToolToken::as_select())
        .first::<ToolToken>(&mut conn)
        .optional()?;

    let token = token.ok_or(ServiceError::Unauthorized)?;

    if let Some(expires_at) = token.expires_at {
        if expires_at < chrono::Utc::now().naive_utc() {
            return Err(ServiceError::Unauthorized);
        }
    }

    diesel::update(tool_tokens_columns::tool_tokens.filter(tool_tokens_columns::id.eq(token.id)))
        .set(tool_tokens_columns::last_used.eq(chrono::Utc::now().naive_utc()))
        .execute(&mut conn)?;

    let user: User = users_columns::users
        .filter(users_columns::id.eq(token.owner_id))
        .filter(users_columns::is_active.eq(true))
        .select(User::as_select())
        .first::<User>(&mut conn)?;

    Ok(user)
}

pub fn revoke_tool_token_query(
    token_id: uuid::Uuid,
    owner_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::tool_tokens::dsl as tool_tokens_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let updated = diesel::update(
        tool_tokens_columns::tool_tokens
            .filter(tool_tokens_columns::id.eq(token_id))
            .filter(tool_tokens_columns::owner_id.eq(owner_id)),
    )
    .set(tool_tokens_columns::active.eq(false))
    .execute(&mut conn)?;

    if updated == 0 {
        return Err(ServiceError::NotFound("Tool token not found".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::User;

    fn test_user() -> User {
        let mut user = User::from_details("alice", "alice@acme.test", "hash", None);
        user.is_superuser = false;
        user.role_codes = vec!["editor".to_string()];
        user
    }

    fn with_secret<T>(f: impl FnOnce() -> T) -> T {
        std::env::set_var("JWT_SECRET", "test-signing-secret");
        f()
    }

    #[test]
    fn claims_round_trip() {
        with_secret(|| {
            let user = test_user();
            let claims = mint_claims(&user, TokenKind::Access, ACCESS_TOKEN_TTL_SECS, None);
            let token = encode_token(&claims).unwrap();
            let decoded = decode_token(&token).unwrap();

            assert_eq!(decoded.sub, user.id.to_string());
            assert_eq!(decoded.username, "alice");
            assert_eq!(decoded.roles, vec!["editor".to_string()]);
            assert_eq!(decoded.kind, TokenKind::Access);
            assert!(decoded.jti.is_none());

            let logged = logged_user_from_claims(&decoded).unwrap();
            assert_eq!(logged.id, user.id);
            assert!(!logged.is_superuser);
        })
    }

    #[test]
    fn expired_token_is_rejected() {
        with_secret(|| {
            let user = test_user();
            let mut claims = mint_claims(&user, TokenKind::Access, ACCESS_TOKEN_TTL_SECS, None);
            claims.iat -= 2 * ACCESS_TOKEN_TTL_SECS;
            claims.exp -= 2 * ACCESS_TOKEN_TTL_SECS;
            let token = encode_token(&claims).unwrap();

            assert!(decode_token(&token).is_err());
        })
    }

    #[test]
    fn garbage_token_is_rejected() {
        with_secret(|| {
            assert!(decode_token("not-a-token").is_err());
        })
    }
}
