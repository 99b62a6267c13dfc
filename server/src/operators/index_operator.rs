use crate::{errors::ServiceError, get_env};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use utoipa::ToSchema;

const INDEX_TIMEOUT: Duration = Duration::from_secs(30);

pub fn es_base_url() -> &'static str {
    get_env!("ELASTICSEARCH_URL", "ELASTICSEARCH_URL should be set")
}

pub fn es_index_name() -> String {
    std::env::var("ELASTICSEARCH_INDEX").unwrap_or("knowledge_base".to_string())
}

pub fn embedding_dim() -> usize {
    std::env::var("EMBEDDING_DIM")
        .unwrap_or("1536".to_string())
        .parse()
        .unwrap_or(1536)
}

fn with_auth(builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match (
        std::env::var("ELASTICSEARCH_USERNAME").ok(),
        std::env::var("ELASTICSEARCH_PASSWORD").ok(),
    ) {
        (Some(username), password) if !username.is_empty() => {
            builder.basic_auth(username, password)
        }
        _ => builder,
    }
}

/// Permission snapshot denormalized onto every chunk document. Must equal
/// the owning version's attributes at index time.
#[derive(Debug, Serialize, Deserialize, Clone, Default, ToSchema)]
pub struct ChunkDocumentMetadata {
    pub document_id: String,
    pub group_id: String,
    pub filename: String,
    pub filepath: String,
    pub file_type: String,
    pub page_number: i32,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    pub visibility: String,
    pub shared_with_users: Vec<String>,
    pub shared_with_roles: Vec<String>,
    pub checksum: String,
    pub original_file_url: String,
    pub page_image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub indexed_at: String,
}

/// One chunk as stored in the index: analyzed text, the dense vector, and
/// the page-level fields ranking and highlighting read.
#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct ChunkDocument {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_vector: Option<Vec<f32>>,
    pub document_name: String,
    pub page_number: i32,
    pub total_pages: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawing_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default)]
    pub equipment_tags: Vec<String>,
    #[serde(default)]
    pub component_details: Vec<String>,
    pub metadata: ChunkDocumentMetadata,
}

fn index_mapping() -> serde_json::Value {
    json!({
        "settings": {
            "index": {
                "refresh_interval": "1s"
            }
        },
        "mappings": {
            "properties": {
                "text": {"type": "text"},
                "content_vector": {
                    "type": "dense_vector",
                    "dims": embedding_dim(),
                    "index": true,
                    "similarity": "cosine"
                },
                "document_name": {
                    "type": "text",
                    "fields": {"keyword": {"type": "keyword"}}
                },
                "page_number": {"type": "integer"},
                "total_pages": {"type": "integer"},
                "drawing_number": {"type": "text"},
                "project_name": {"type": "text"},
                "equipment_tags": {"type": "keyword"},
                "component_details": {"type": "text"},
                "metadata": {
                    "properties": {
                        "document_id": {"type": "keyword"},
                        "group_id": {"type": "keyword"},
                        "filename": {
                            "type": "text",
                            "fields": {"keyword": {"type": "keyword"}}
                        },
                        "filepath": {"type": "text"},
                        "file_type": {"type": "keyword"},
                        "page_number": {"type": "integer"},
                        "owner_id": {"type": "keyword"},
                        "org_id": {"type": "keyword"},
                        "visibility": {"type": "keyword"},
                        "shared_with_users": {"type": "keyword"},
                        "shared_with_roles": {"type": "keyword"},
                        "checksum": {"type": "keyword"},
                        "original_file_url": {"type": "keyword", "index": false},
                        "page_image_url": {"type": "keyword", "index": false},
                        "category": {"type": "keyword"},
                        "tags": {"type": "keyword"},
                        "author": {"type": "text"},
                        "description": {"type": "text"},
                        "indexed_at": {"type": "date"}
                    }
                }
            }
        }
    })
}

/// Creates the chunk index with its mapping if it does not exist yet.
pub async fn ensure_index(reqwest_client: reqwest::Client) -> Result<bool, ServiceError> {
    let index_url = format!("{}/{}", es_base_url(), es_index_name());

    let head = with_auth(reqwest_client.head(&index_url))
        .timeout(INDEX_TIMEOUT)
        .send()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(format!("index store: {}", err)))?;

    if head.status().is_success() {
        return Ok(false);
    }

    let resp = with_auth(reqwest_client.put(&index_url))
        .timeout(INDEX_TIMEOUT)
        .json(&index_mapping())
        .send()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(format!("index store: {}", err)))?;

    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ServiceError::InternalServerError(format!(
            "Could not create index: {}",
            body
        )));
    }

    Ok(true)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// Bulk-writes chunk documents, idempotent on chunk id. `refresh` makes the
/// writes immediately searchable and is only requested on the final batch.
pub async fn bulk_index_chunks(
    reqwest_client: reqwest::Client,
    docs: Vec<(String, ChunkDocument)>,
    refresh: bool,
) -> Result<(), ServiceError> {
    if docs.is_empty() {
        return Ok(());
    }

    let index_name = es_index_name();
    let mut body = String::new();
    for (chunk_id, doc) in docs.iter() {
        body.push_str(
            &json!({"index": {"_index": index_name, "_id": chunk_id}}).to_string(),
        );
        body.push('\n');
        body.push_str(&serde_json::to_string(doc).map_err(|_| {
            ServiceError::InternalServerError("Could not serialize chunk document".to_string())
        })?);
        body.push('\n');
    }

    let url = format!(
        "{}/_bulk?refresh={}",
        es_base_url(),
        if refresh { "true" } else { "false" }
    );

    let resp = with_auth(reqwest_client.post(&url))
        .timeout(INDEX_TIMEOUT)
        .header("Content-Type", "application/x-ndjson")
        .body(body)
        .send()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(format!("index store: {}", err)))?;

    if !resp.status().is_success() {
        return Err(ServiceError::ServiceUnavailable(format!(
            "bulk index returned status {}",
            resp.status()
        )));
    }

    let bulk: BulkResponse = resp.json().await.map_err(|err| {
        ServiceError::InternalServerError(format!("Could not parse bulk response: {}", err))
    })?;

    if bulk.errors {
        let first_error = bulk
            .items
            .iter()
            .find_map(|item| item["index"]["error"]["reason"].as_str())
            .unwrap_or("unknown bulk failure");
        return Err(ServiceError::InternalServerError(format!(
            "bulk index reported item failures: {}",
            first_error
        )));
    }

    Ok(())
}

pub async fn delete_chunks_by_version(
    reqwest_client: reqwest::Client,
    version_id: uuid::Uuid,
) -> Result<u64, ServiceError> {
    let url = format!(
        "{}/{}/_delete_by_query?refresh=true",
        es_base_url(),
        es_index_name()
    );

    let resp = with_auth(reqwest_client.post(&url))
        .timeout(INDEX_TIMEOUT)
        .json(&json!({
            "query": {"term": {"metadata.document_id": version_id.to_string()}}
        }))
        .send()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(format!("index store: {}", err)))?;

    if !resp.status().is_success() {
        return Err(ServiceError::ServiceUnavailable(format!(
            "delete_by_query returned status {}",
            resp.status()
        )));
    }

    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    Ok(body["deleted"].as_u64().unwrap_or(0))
}

/// Selective re-index of the permission snapshot for every chunk of a
/// version, used when visibility or shares change.
pub async fn update_permissions_by_version(
    reqwest_client: reqwest::Client,
    version_id: uuid::Uuid,
    visibility: &str,
    shared_with_users: Vec<String>,
    shared_with_roles: Vec<String>,
) -> Result<u64, ServiceError> {
    let url = format!(
        "{}/{}/_update_by_query?refresh=true",
        es_base_url(),
        es_index_name()
    );

    let resp = with_auth(reqwest_client.post(&url))
        .timeout(INDEX_TIMEOUT)
        .json(&json!({
            "query": {"term": {"metadata.document_id": version_id.to_string()}},
            "script": {
                "source": "ctx._source.metadata.visibility = params.visibility; \
                           ctx._source.metadata.shared_with_users = params.shared_with_users; \
                           ctx._source.metadata.shared_with_roles = params.shared_with_roles;",
                "lang": "painless",
                "params": {
                    "visibility": visibility,
                    "shared_with_users": shared_with_users,
                    "shared_with_roles": shared_with_roles
                }
            }
        }))
        .send()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(format!("index store: {}", err)))?;

    if !resp.status().is_success() {
        return Err(ServiceError::ServiceUnavailable(format!(
            "update_by_query returned status {}",
            resp.status()
        )));
    }

    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    Ok(body["updated"].as_u64().unwrap_or(0))
}

#[derive(Debug, Deserialize, Clone)]
pub struct EsHit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_score")]
    pub score: Option<f64>,
    #[serde(rename = "_source")]
    pub source: serde_json::Value,
    #[serde(default)]
    pub highlight: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EsHitsEnvelope {
    pub hits: Vec<EsHit>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EsSearchResponse {
    pub hits: EsHitsEnvelope,
}

pub async fn execute_search(
    reqwest_client: reqwest::Client,
    body: serde_json::Value,
) -> Result<EsSearchResponse, ServiceError> {
    let url = format!("{}/{}/_search", es_base_url(), es_index_name());

    let resp = with_auth(reqwest_client.post(&url))
        .timeout(INDEX_TIMEOUT)
        .json(&body)
        .send()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(format!("index store: {}", err)))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let detail = resp.text().await.unwrap_or_default();
        log::error!("search request failed with {}: {}", status, detail);
        return Err(ServiceError::ServiceUnavailable(format!(
            "search returned status {}",
            status
        )));
    }

    resp.json::<EsSearchResponse>().await.map_err(|err| {
        ServiceError::InternalServerError(format!("Could not parse search response: {}", err))
    })
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct BucketCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct IndexStats {
    pub document_count: u64,
    pub categories: Vec<BucketCount>,
    pub file_types: Vec<BucketCount>,
}

pub async fn index_stats(reqwest_client: reqwest::Client) -> Result<IndexStats, ServiceError> {
    let url = format!("{}/{}/_search", es_base_url(), es_index_name());

    let resp = with_auth(reqwest_client.post(&url))
        .timeout(INDEX_TIMEOUT)
        .json(&json!({
            "size": 0,
            "track_total_hits": true,
            "aggs": {
                "categories": {
                    "terms": {"field": "metadata.category", "size": 10, "missing": "uncategorized"}
                },
                "file_types": {
                    "terms": {"field": "metadata.file_type", "size": 10, "missing": "unknown"}
                }
            }
        }))
        .send()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(format!("index store: {}", err)))?;

    if !resp.status().is_success() {
        return Err(ServiceError::ServiceUnavailable(format!(
            "stats query returned status {}",
            resp.status()
        )));
    }

    let body: serde_json::Value = resp.json().await.unwrap_or_default();

    let parse_buckets = |key: &str| -> Vec<BucketCount> {
        body["aggregations"][key]["buckets"]
            .as_array()
            .map(|buckets| {
                buckets
                    .iter()
                    .map(|b| BucketCount {
                        name: b["key"].as_str().unwrap_or_default().to_string(),
                        count: b["doc_count"].as_u64().unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok(IndexStats {
        document_count: body["hits"]["total"]["value"].as_u64().unwrap_or(0),
        categories: parse_buckets("categories"),
        file_types: parse_buckets("file_types"),
    })
}

/// Distinct version ids present in the index, for orphan reconciliation.
pub async fn list_indexed_version_ids(
    reqwest_client: reqwest::Client,
) -> Result<Vec<String>, ServiceError> {
    let url = format!("{}/{}/_search", es_base_url(), es_index_name());

    let resp = with_auth(reqwest_client.post(&url))
        .timeout(INDEX_TIMEOUT)
        .json(&json!({
            "size": 0,
            "aggs": {
                "versions": {"terms": {"field": "metadata.document_id", "size": 10000}}
            }
        }))
        .send()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(format!("index store: {}", err)))?;

    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    Ok(body["aggregations"]["versions"]["buckets"]
        .as_array()
        .map(|buckets| {
            buckets
                .iter()
                .filter_map(|b| b["key"].as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default())
}

/// Thin authenticated passthrough used by the superuser-only raw-query tool
/// and the ops CLI.
pub async fn raw_request(
    reqwest_client: reqwest::Client,
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
) -> Result<serde_json::Value, ServiceError> {
    let url = format!("{}/{}", es_base_url(), path.trim_start_matches('/'));

    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| ServiceError::BadRequest("Invalid HTTP method".to_string()))?;

    let mut builder = with_auth(reqwest_client.request(method, &url)).timeout(INDEX_TIMEOUT);
    if let Some(body) = body {
        builder = builder.json(&body);
    }

    let resp = builder
        .send()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(format!("index store: {}", err)))?;

    resp.json::<serde_json::Value>().await.map_err(|err| {
        ServiceError::InternalServerError(format!("Could not parse index response: {}", err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_has_vector_and_permission_fields() {
        let mapping = index_mapping();
        let props = &mapping["mappings"]["properties"];

        assert_eq!(props["content_vector"]["type"], "dense_vector");
        assert_eq!(props["content_vector"]["similarity"], "cosine");

        let metadata = &props["metadata"]["properties"];
        for field in [
            "owner_id",
            "org_id",
            "visibility",
            "shared_with_users",
            "shared_with_roles",
            "checksum",
        ] {
            assert_eq!(metadata[field]["type"], "keyword", "field {}", field);
        }
    }

    #[test]
    fn chunk_document_omits_missing_vector() {
        let doc = ChunkDocument {
            text: "pump seal".to_string(),
            content_vector: None,
            document_name: "manual.pdf".to_string(),
            page_number: 1,
            total_pages: 2,
            drawing_number: None,
            project_name: None,
            equipment_tags: vec![],
            component_details: vec![],
            metadata: ChunkDocumentMetadata::default(),
        };

        let value = serde_json::to_value(&doc).unwrap();
        assert!(value.get("content_vector").is_none());
        assert!(value.get("drawing_number").is_none());
    }
}
