use crate::{
    data::models::{Pool, User},
    errors::ServiceError,
};
use actix_web::web;
use argon2::Config;
use diesel::prelude::*;
use once_cell::sync::Lazy;
use rand::{distributions::Alphanumeric, Rng};

pub static SECRET_KEY: Lazy<String> =
    Lazy::new(|| std::env::var("SECRET_KEY").unwrap_or_else(|_| "0123".repeat(16)));

static SALT: Lazy<String> =
    Lazy::new(|| std::env::var("SALT").unwrap_or_else(|_| "docbasesalt".to_string()));

/// Deterministic argon2 digest keyed on the server secret. Determinism lets
/// tool-token lookups go through an indexed equality filter.
pub fn hash_password(password: &str) -> Result<String, ServiceError> {
    let config = Config {
        secret: SECRET_KEY.as_bytes(),
        ..Config::original()
    };
    argon2::hash_encoded(password.as_bytes(), SALT.as_bytes(), &config).map_err(|_err| {
        ServiceError::InternalServerError("Error processing password, try again".to_string())
    })
}

pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect::<String>()
}

pub fn create_user_query(new_user: User, pool: web::Data<Pool>) -> Result<User, ServiceError> {
    use crate::data::schema::users::dsl as users_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let user: User = diesel::insert_into(users_columns::users)
        .values(&new_user)
        .get_result(&mut conn)?;

    Ok(user)
}

pub fn get_user_by_id_query(
    user_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<User, ServiceError> {
    use crate::data::schema::users::dsl as users_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let user: Option<User> = users_columns::users
        .filter(users_columns::id.eq(user_id))
        .select(User::as_select())
        .first::<User>(&mut conn)
        .optional()?;

    user.ok_or(ServiceError::NotFound("User not found".to_string()))
}

pub fn get_user_by_username_query(
    username: &str,
    pool: web::Data<Pool>,
) -> Result<User, ServiceError> {
    use crate::data::schema::users::dsl as users_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let user: Option<User> = users_columns::users
        .filter(users_columns::username.eq(username))
        .select(User::as_select())
        .first::<User>(&mut conn)
        .optional()?;

    user.ok_or(ServiceError::NotFound("User not found".to_string()))
}

/// Checks the password against the stored digest. The same error is returned
/// for an unknown user and a wrong password.
pub fn authenticate_user_query(
    username: &str,
    password: &str,
    pool: web::Data<Pool>,
) -> Result<User, ServiceError> {
    let user = get_user_by_username_query(username, pool.clone())
        .map_err(|_| ServiceError::Unauthorized)?;

    if !user.is_active {
        return Err(ServiceError::Unauthorized);
    }

    let candidate_hash = hash_password(password)?;
    if candidate_hash != user.hash {
        return Err(ServiceError::Unauthorized);
    }

    set_last_login_query(user.id, pool)?;

    Ok(user)
}

pub fn set_last_login_query(user_id: uuid::Uuid, pool: web::Data<Pool>) -> Result<(), ServiceError> {
    use crate::data::schema::users::dsl as users_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    diesel::update(users_columns::users.filter(users_columns::id.eq(user_id)))
        .set(users_columns::last_login.eq(chrono::Utc::now().naive_utc()))
        .execute(&mut conn)?;

    Ok(())
}

/// Organization memberships for a set of users, used to validate share
/// targets.
pub fn get_user_orgs_query(
    user_ids: Vec<uuid::Uuid>,
    pool: web::Data<Pool>,
) -> Result<Vec<(uuid::Uuid, Option<uuid::Uuid>)>, ServiceError> {
    use crate::data::schema::users::dsl as users_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let rows: Vec<(uuid::Uuid, Option<uuid::Uuid>)> = users_columns::users
        .filter(users_columns::id.eq_any(&user_ids))
        .select((users_columns::id, users_columns::org_id))
        .load(&mut conn)?;

    if rows.len() != user_ids.len() {
        return Err(ServiceError::BadRequest(
            "Unknown user in share list".to_string(),
        ));
    }

    Ok(rows)
}

pub fn any_superuser_exists_query(pool: web::Data<Pool>) -> Result<bool, ServiceError> {
    use crate::data::schema::users::dsl as users_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let count: i64 = users_columns::users
        .filter(users_columns::is_superuser.eq(true))
        .count()
        .get_result(&mut conn)?;

    Ok(count > 0)
}
