use crate::{
    data::models::{LoggedUser, Pool},
    errors::{ErrorResponseBody, ServiceError},
    operators::{
        index_operator::raw_request,
        search_operator::{search_chunks, SearchParams},
    },
};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request envelope of the tool-protocol surface. External AI assistants
/// call named tools with a JSON argument object; authentication is the
/// same bearer scheme as the rest of the API, typically with a tool token.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ToolCallReqPayload {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct HybridSearchArgs {
    query: String,
    size: Option<u64>,
    min_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawQueryArgs {
    method: String,
    path: String,
    params: Option<serde_json::Value>,
    body: Option<serde_json::Value>,
}

fn query_string_of(params: &serde_json::Value) -> String {
    params
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(key, value)| {
                    let value = value.as_str().map(|s| s.to_string()).unwrap_or(value.to_string());
                    format!("{}={}", key, value)
                })
                .collect::<Vec<_>>()
                .join("&")
        })
        .unwrap_or_default()
}

/// Call tool
///
/// Dispatches one of the two exposed tools: `hybrid_search` wraps the
/// retrieval surface under the caller's permissions; `execute_raw_query`
/// is a superuser-only passthrough to the index store.
#[utoipa::path(
    post,
    path = "/tools/call",
    tag = "Tools",
    request_body(content = ToolCallReqPayload, content_type = "application/json"),
    responses(
        (status = 200, description = "Tool result"),
        (status = 400, description = "Unknown tool or malformed arguments", body = ErrorResponseBody),
        (status = 403, description = "Tool requires superuser", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn call_tool(
    payload: web::Json<ToolCallReqPayload>,
    user: LoggedUser,
    pool: web::Data<Pool>,
    reqwest_client: web::Data<reqwest::Client>,
) -> Result<HttpResponse, actix_web::Error> {
    let payload = payload.into_inner();

    match payload.name.as_str() {
        "hybrid_search" => {
            let args: HybridSearchArgs = serde_json::from_value(payload.arguments)
                .map_err(|err| ServiceError::BadRequest(format!("Invalid arguments: {}", err)))?;

            let params = SearchParams {
                query: args.query,
                k: args.size.unwrap_or(5).min(100),
                filters: None,
                use_hybrid: true,
                min_score: args.min_score,
            };

            let results = search_chunks(
                params,
                Some(&user),
                reqwest_client.get_ref().clone(),
                pool,
            )
            .await?;

            Ok(HttpResponse::Ok().json(serde_json::json!({
                "tool": "hybrid_search",
                "total": results.len(),
                "results": results,
            })))
        }
        "execute_raw_query" => {
            if !user.is_superuser {
                return Err(ServiceError::Forbidden.into());
            }

            let args: RawQueryArgs = serde_json::from_value(payload.arguments)
                .map_err(|err| ServiceError::BadRequest(format!("Invalid arguments: {}", err)))?;

            let path = match args.params.as_ref().map(query_string_of) {
                Some(query_string) if !query_string.is_empty() => {
                    format!("{}?{}", args.path, query_string)
                }
                _ => args.path,
            };

            let result = raw_request(
                reqwest_client.get_ref().clone(),
                &args.method,
                &path,
                args.body,
            )
            .await?;

            Ok(HttpResponse::Ok().json(serde_json::json!({
                "tool": "execute_raw_query",
                "result": result,
            })))
        }
        other => Err(ServiceError::BadRequest(format!("Unknown tool {}", other)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_flatten_to_a_query_string() {
        let params = serde_json::json!({"size": 3, "pretty": "true"});
        let qs = query_string_of(&params);
        assert!(qs.contains("size=3"));
        assert!(qs.contains("pretty=true"));
        assert_eq!(query_string_of(&serde_json::json!(null)), "");
    }
}
