use crate::{
    data::models::{BoundingBox, LoggedUser, Pool},
    errors::ServiceError,
    operators::{
        document_operator::get_page_query,
        index_operator::execute_search,
        model_operator::embed_query,
        permission_operator::permission_filter_fragment,
    },
};
use actix_web::web;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use utoipa::ToSchema;

pub const VECTOR_WEIGHT: f64 = 0.7;
pub const BM25_WEIGHT: f64 = 0.3;

/// Lexical field set with per-field boosts, shared by scoring and
/// highlighting.
const LEXICAL_FIELDS: [&str; 9] = [
    "text^3",
    "metadata.filename^2.5",
    "metadata.description^2",
    "metadata.filepath^1.5",
    "document_name^2",
    "drawing_number^2",
    "project_name^1.5",
    "equipment_tags^1.2",
    "component_details",
];

#[derive(Debug, Serialize, Deserialize, Clone, Default, ToSchema)]
pub struct SearchFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub k: u64,
    pub filters: Option<SearchFilters>,
    pub use_hybrid: bool,
    pub min_score: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct MatchedBoundingBox {
    pub text: String,
    pub confidence: f64,
    pub bbox: [f64; 4],
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct SearchResult {
    pub id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlighted: Option<String>,
    pub score: f64,
    pub document_name: String,
    pub page_number: i32,
    pub matched_bboxes: Vec<MatchedBoundingBox>,
    pub metadata: serde_json::Value,
}

fn filter_terms(filters: &SearchFilters) -> Vec<serde_json::Value> {
    let mut terms = vec![];
    if let Some(file_type) = &filters.file_type {
        terms.push(json!({"term": {"metadata.file_type": file_type}}));
    }
    if let Some(filename) = &filters.filename {
        terms.push(json!({
            "wildcard": {"metadata.filename.keyword": format!("*{}*", filename)}
        }));
    }
    if let Some(category) = &filters.category {
        terms.push(json!({"term": {"metadata.category": category}}));
    }
    if let Some(tags) = &filters.tags {
        if !tags.is_empty() {
            terms.push(json!({"terms": {"metadata.tags": tags}}));
        }
    }
    terms
}

fn highlight_clause() -> serde_json::Value {
    let mut fields = serde_json::Map::new();
    for field in LEXICAL_FIELDS {
        let name = field.split('^').next().unwrap_or(field);
        fields.insert(
            name.to_string(),
            json!({
                "fragment_size": 150,
                "number_of_fragments": 3,
                "pre_tags": ["<mark>"],
                "post_tags": ["</mark>"]
            }),
        );
    }
    serde_json::Value::Object(
        std::iter::once(("fields".to_string(), serde_json::Value::Object(fields))).collect(),
    )
}

/// Composes the compound index query: the permission fragment and filters
/// as `must`, the cosine and lexical scorers as weighted `should` clauses.
pub fn build_search_body(
    params: &SearchParams,
    query_vector: Option<&[f32]>,
    permission_fragment: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut must: Vec<serde_json::Value> = vec![];
    if let Some(fragment) = permission_fragment {
        must.push(fragment);
    }
    if let Some(filters) = &params.filters {
        must.extend(filter_terms(filters));
    }

    let mut should: Vec<serde_json::Value> = vec![];
    if let Some(vector) = query_vector {
        should.push(json!({
            "script_score": {
                "query": {"match_all": {}},
                "script": {
                    "source": format!(
                        "cosineSimilarity(params.query_vector, 'content_vector') * {}",
                        VECTOR_WEIGHT
                    ),
                    "params": {"query_vector": vector}
                }
            }
        }));
    }
    if !params.query.trim().is_empty() {
        should.push(json!({
            "multi_match": {
                "query": params.query,
                "fields": LEXICAL_FIELDS,
                "type": "best_fields",
                "operator": "or",
                "fuzziness": "AUTO",
                "boost": BM25_WEIGHT
            }
        }));
    }

    let mut bool_query = serde_json::Map::new();
    if !must.is_empty() {
        bool_query.insert("must".to_string(), json!(must));
    }
    if !should.is_empty() {
        bool_query.insert("should".to_string(), json!(should));
        bool_query.insert("minimum_should_match".to_string(), json!(1));
    }

    let mut body = serde_json::Map::new();
    body.insert("size".to_string(), json!(params.k));
    body.insert(
        "query".to_string(),
        json!({"bool": serde_json::Value::Object(bool_query)}),
    );

    if should.is_empty() {
        // Filter-only listing: no scorers, newest content first.
        body.insert(
            "sort".to_string(),
            json!([{"metadata.indexed_at": {"order": "desc", "unmapped_type": "date"}}]),
        );
    } else {
        body.insert("highlight".to_string(), highlight_clause());
        if let Some(min_score) = params.min_score {
            body.insert("min_score".to_string(), json!(min_score));
        }
    }

    serde_json::Value::Object(body)
}

/// Lowercased alphanumeric query tokens for bounding-box intersection.
pub fn tokenize_query(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
        .collect()
}

/// Boxes whose text shares at least one token with the query, most
/// confident first.
pub fn matched_bboxes(tokens: &[String], boxes: &[BoundingBox]) -> Vec<MatchedBoundingBox> {
    let mut matches: Vec<MatchedBoundingBox> = boxes
        .iter()
        .filter(|bbox| {
            let box_tokens = tokenize_query(&bbox.text);
            box_tokens.iter().any(|token| tokens.contains(token))
        })
        .map(|bbox| MatchedBoundingBox {
            text: bbox.text.clone(),
            confidence: bbox.confidence,
            bbox: bbox.bbox,
        })
        .collect();

    matches.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches
}

fn indexed_at_of(source: &serde_json::Value) -> String {
    source["metadata"]["indexed_at"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

/// Deterministic ordering: score desc, then newer content, then smaller
/// page number.
pub fn sort_results(results: &mut [(SearchResult, String)]) {
    results.sort_by(|(a, a_indexed), (b, b_indexed)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b_indexed.cmp(a_indexed))
            .then_with(|| a.page_number.cmp(&b.page_number))
    });
}

/// Permission-filtered hybrid retrieval with bounding-box enrichment.
pub async fn search_chunks(
    params: SearchParams,
    user: Option<&LoggedUser>,
    reqwest_client: reqwest::Client,
    pool: web::Data<Pool>,
) -> Result<Vec<SearchResult>, ServiceError> {
    if params.k == 0 {
        return Ok(vec![]);
    }

    let query_vector = if params.use_hybrid && !params.query.trim().is_empty() {
        Some(embed_query(params.query.clone(), &reqwest_client).await?)
    } else {
        None
    };

    let body = build_search_body(
        &params,
        query_vector.as_deref(),
        permission_filter_fragment(user),
    );

    let response = execute_search(reqwest_client, body).await?;

    let tokens = tokenize_query(&params.query);

    let hit_pages: Vec<Option<(uuid::Uuid, i32)>> = response
        .hits
        .hits
        .iter()
        .map(|hit| {
            let page_number = hit.source["page_number"]
                .as_i64()
                .or(hit.source["metadata"]["page_number"].as_i64())
                .unwrap_or(1) as i32;
            hit.source["metadata"]["document_id"]
                .as_str()
                .and_then(|id| id.parse::<uuid::Uuid>().ok())
                .map(|version_id| (version_id, page_number))
        })
        .collect();

    // One blocking round over the distinct pages of the hit set; the OCR
    // boxes live in metadata rows, not in the index.
    let mut distinct_pages: Vec<(uuid::Uuid, i32)> = hit_pages.iter().flatten().copied().collect();
    distinct_pages.sort();
    distinct_pages.dedup();

    let page_boxes: HashMap<(uuid::Uuid, i32), Vec<BoundingBox>> = web::block(move || {
        let mut map = HashMap::new();
        for (version_id, page_number) in distinct_pages {
            let boxes = get_page_query(version_id, page_number, pool.clone())
                .map(|page| page.bounding_boxes())
                .unwrap_or_default();
            map.insert((version_id, page_number), boxes);
        }
        Ok::<_, ServiceError>(map)
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    let mut scored: Vec<(SearchResult, String)> = vec![];
    for (hit, page_key) in response.hits.hits.into_iter().zip(hit_pages) {
        let source = hit.source;

        let page_number = page_key.map(|(_, page)| page).unwrap_or_else(|| {
            source["page_number"]
                .as_i64()
                .or(source["metadata"]["page_number"].as_i64())
                .unwrap_or(1) as i32
        });

        let boxes = page_key
            .and_then(|key| page_boxes.get(&key))
            .cloned()
            .unwrap_or_default();

        let highlighted = hit
            .highlight
            .get("text")
            .or_else(|| hit.highlight.values().next())
            .map(|fragments| fragments.join(" ... "));

        let indexed_at = indexed_at_of(&source);
        scored.push((
            SearchResult {
                id: hit.id,
                text: source["text"].as_str().unwrap_or_default().to_string(),
                highlighted,
                score: hit.score.unwrap_or(0.0),
                document_name: source["document_name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                page_number,
                matched_bboxes: matched_bboxes(&tokens, &boxes),
                metadata: source["metadata"].clone(),
            },
            indexed_at,
        ));
    }

    sort_results(&mut scored);

    Ok(scored.into_iter().map(|(result, _)| result).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(query: &str, hybrid: bool) -> SearchParams {
        SearchParams {
            query: query.to_string(),
            k: 5,
            filters: None,
            use_hybrid: hybrid,
            min_score: None,
        }
    }

    #[test]
    fn hybrid_body_carries_both_scorers() {
        let vector = vec![0.1f32; 4];
        let fragment = permission_filter_fragment(None);
        let body = build_search_body(&params("reset procedure", true), Some(&vector), fragment);

        assert_eq!(body["size"], 5);

        let should = body["query"]["bool"]["should"].as_array().unwrap();
        assert_eq!(should.len(), 2);
        assert!(should[0]["script_score"]["script"]["source"]
            .as_str()
            .unwrap()
            .contains("cosineSimilarity"));
        assert!(should[0]["script_score"]["script"]["source"]
            .as_str()
            .unwrap()
            .contains("0.7"));
        assert_eq!(should[1]["multi_match"]["boost"], 0.3);
        assert_eq!(should[1]["multi_match"]["fuzziness"], "AUTO");
        assert_eq!(should[1]["multi_match"]["operator"], "or");
        assert_eq!(body["query"]["bool"]["minimum_should_match"], 1);

        // permission fragment sits in must
        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must[0]["bool"]["minimum_should_match"], 1);

        assert!(body["highlight"]["fields"]["text"].is_object());
    }

    #[test]
    fn empty_query_degrades_to_sorted_listing() {
        let body = build_search_body(&params("", true), None, None);

        assert!(body["query"]["bool"].get("should").is_none());
        assert_eq!(body["sort"][0]["metadata.indexed_at"]["order"], "desc");
        assert!(body.get("highlight").is_none());
    }

    #[test]
    fn min_score_and_filters_are_applied() {
        let mut search_params = params("pump", false);
        search_params.min_score = Some(0.5);
        search_params.filters = Some(SearchFilters {
            file_type: Some("pdf".to_string()),
            filename: Some("manual".to_string()),
            category: None,
            tags: None,
        });

        let body = build_search_body(&search_params, None, None);
        assert_eq!(body["min_score"], 0.5);

        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must[0]["term"]["metadata.file_type"], "pdf");
        assert_eq!(must[1]["wildcard"]["metadata.filename.keyword"], "*manual*");
    }

    #[test]
    fn query_tokenization_is_lowercased_alphanumeric() {
        assert_eq!(
            tokenize_query("Reset-Procedure: Step 2!"),
            vec!["reset", "procedure", "step", "2"]
        );
        assert!(tokenize_query("  ...  ").is_empty());
    }

    #[test]
    fn bbox_matching_intersects_tokens_and_sorts_by_confidence() {
        let boxes = vec![
            BoundingBox {
                text: "Reset valve".to_string(),
                confidence: 0.6,
                bbox: [0.0, 0.0, 10.0, 10.0],
            },
            BoundingBox {
                text: "procedure overview".to_string(),
                confidence: 0.9,
                bbox: [0.0, 20.0, 10.0, 30.0],
            },
            BoundingBox {
                text: "unrelated".to_string(),
                confidence: 0.99,
                bbox: [0.0, 40.0, 10.0, 50.0],
            },
        ];

        let tokens = tokenize_query("reset procedure");
        let matches = matched_bboxes(&tokens, &boxes);

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].text, "procedure overview");
        assert_eq!(matches[1].text, "Reset valve");
    }

    #[test]
    fn equal_scores_tie_break_on_recency_then_page() {
        let result = |page: i32| SearchResult {
            id: format!("chunk-{}", page),
            text: String::new(),
            highlighted: None,
            score: 1.0,
            document_name: "manual.pdf".to_string(),
            page_number: page,
            matched_bboxes: vec![],
            metadata: serde_json::Value::Null,
        };

        let mut results = vec![
            (result(2), "2024-01-01T00:00:00Z".to_string()),
            (result(3), "2024-02-01T00:00:00Z".to_string()),
            (result(1), "2024-02-01T00:00:00Z".to_string()),
        ];
        sort_results(&mut results);

        let order: Vec<i32> = results.iter().map(|(r, _)| r.page_number).collect();
        assert_eq!(order, vec![1, 3, 2]);
    }
}
