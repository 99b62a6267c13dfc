use crate::{
    data::models::{LoggedUser, Pool},
    errors::ErrorResponseBody,
    operators::{
        index_operator::index_stats,
        search_operator::{search_chunks, SearchFilters, SearchParams, SearchResult},
    },
};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const DEFAULT_RESULT_COUNT: u64 = 5;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SearchReqPayload {
    pub query: String,
    pub k: Option<u64>,
    pub filters: Option<SearchFilters>,
    pub use_hybrid: Option<bool>,
    pub min_score: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SearchResponseBody {
    pub results: Vec<SearchResult>,
    pub total: usize,
}

/// Search
///
/// Permission-filtered hybrid retrieval over indexed chunks. Anonymous
/// callers only ever see public documents.
#[utoipa::path(
    post,
    path = "/search",
    tag = "Search",
    request_body(content = SearchReqPayload, content_type = "application/json"),
    responses(
        (status = 200, description = "Ranked results with bounding-box matches", body = SearchResponseBody),
        (status = 503, description = "Index or embedding backend unavailable", body = ErrorResponseBody),
    ),
)]
pub async fn search(
    payload: web::Json<SearchReqPayload>,
    user: Option<LoggedUser>,
    pool: web::Data<Pool>,
    reqwest_client: web::Data<reqwest::Client>,
) -> Result<HttpResponse, actix_web::Error> {
    let payload = payload.into_inner();

    let params = SearchParams {
        query: payload.query,
        k: payload.k.unwrap_or(DEFAULT_RESULT_COUNT).min(100),
        filters: payload.filters,
        use_hybrid: payload.use_hybrid.unwrap_or(true),
        min_score: payload.min_score,
    };

    let results = search_chunks(
        params,
        user.as_ref(),
        reqwest_client.get_ref().clone(),
        pool,
    )
    .await?;

    let total = results.len();
    Ok(HttpResponse::Ok().json(SearchResponseBody { results, total }))
}

/// Index statistics
#[utoipa::path(
    get,
    path = "/stats",
    tag = "Search",
    responses(
        (status = 200, description = "Chunk count plus category and file-type breakdowns"),
    ),
)]
pub async fn stats(
    reqwest_client: web::Data<reqwest::Client>,
) -> Result<HttpResponse, actix_web::Error> {
    let stats = index_stats(reqwest_client.get_ref().clone()).await?;
    Ok(HttpResponse::Ok().json(stats))
}
