use crate::{
    data::models::{Organization, Pool},
    errors::ServiceError,
};
use actix_web::web;
use diesel::prelude::*;

pub fn create_organization_query(
    new_org: Organization,
    pool: web::Data<Pool>,
) -> Result<Organization, ServiceError> {
    use crate::data::schema::organizations::dsl as orgs_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let org: Organization = diesel::insert_into(orgs_columns::organizations)
        .values(&new_org)
        .get_result(&mut conn)?;

    Ok(org)
}

pub fn get_organization_by_id_query(
    org_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Organization, ServiceError> {
    use crate::data::schema::organizations::dsl as orgs_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let org: Option<Organization> = orgs_columns::organizations
        .filter(orgs_columns::id.eq(org_id))
        .select(Organization::as_select())
        .first::<Organization>(&mut conn)
        .optional()?;

    org.ok_or(ServiceError::NotFound("Organization not found".to_string()))
}

pub fn get_organization_by_name_query(
    name: &str,
    pool: web::Data<Pool>,
) -> Result<Option<Organization>, ServiceError> {
    use crate::data::schema::organizations::dsl as orgs_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let org: Option<Organization> = orgs_columns::organizations
        .filter(orgs_columns::name.eq(name))
        .select(Organization::as_select())
        .first::<Organization>(&mut conn)
        .optional()?;

    Ok(org)
}
