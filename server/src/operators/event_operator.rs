use crate::{
    data::models::{Event, Pool},
    errors::ServiceError,
};
use actix_web::web;
use diesel::prelude::*;

pub fn create_event_query(event: Event, pool: web::Data<Pool>) -> Result<Event, ServiceError> {
    use crate::data::schema::events::dsl as events_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let event: Event = diesel::insert_into(events_columns::events)
        .values(&event)
        .get_result(&mut conn)?;

    Ok(event)
}

