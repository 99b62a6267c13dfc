use crate::{
    errors::{PipelineError, ServiceError},
    get_env,
};
use base64::Engine;
use derive_more::Display;
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub const EMBED_BATCH_SIZE: usize = 32;
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);
const VLM_TIMEOUT: Duration = Duration::from_secs(120);
const MODEL_RETRIES: u32 = 3;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    #[display("timeout")]
    Timeout,
    #[display("transport")]
    Transport,
    #[display("bad_response")]
    BadResponse,
    #[display("rate_limited")]
    RateLimited,
}

#[derive(Debug, Display, Clone)]
#[display("model error ({kind}): {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

impl ModelError {
    fn new<M: Into<String>>(kind: ModelErrorKind, message: M) -> Self {
        ModelError {
            kind,
            message: message.into(),
        }
    }

    fn retryable(&self) -> bool {
        !matches!(self.kind, ModelErrorKind::BadResponse)
    }
}

impl From<ModelError> for ServiceError {
    fn from(err: ModelError) -> ServiceError {
        match err.kind {
            ModelErrorKind::RateLimited => ServiceError::RateLimited,
            ModelErrorKind::BadResponse => ServiceError::InternalServerError(err.to_string()),
            _ => ServiceError::ServiceUnavailable(err.to_string()),
        }
    }
}

impl From<ModelError> for PipelineError {
    fn from(err: ModelError) -> PipelineError {
        match err.kind {
            ModelErrorKind::BadResponse => PipelineError::PermanentInput(err.to_string()),
            _ => PipelineError::Transient(err.to_string()),
        }
    }
}

fn classify_send_error(err: &reqwest::Error) -> ModelError {
    if err.is_timeout() {
        ModelError::new(ModelErrorKind::Timeout, err.to_string())
    } else {
        ModelError::new(ModelErrorKind::Transport, err.to_string())
    }
}

fn api_key_header() -> String {
    std::env::var("MODEL_API_KEY").unwrap_or("none".to_string())
}

async fn post_with_retry<B: Serialize, T: DeserializeOwned>(
    reqwest_client: &reqwest::Client,
    url: &str,
    body: &B,
    timeout: Duration,
) -> Result<T, ModelError> {
    let mut last_error = ModelError::new(ModelErrorKind::Transport, "no attempt made");

    for attempt in 0..MODEL_RETRIES {
        let result = reqwest_client
            .post(url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", api_key_header()))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                last_error = classify_send_error(&err);
                if last_error.retryable() {
                    sleep_with_jitter(attempt).await;
                    continue;
                }
                return Err(last_error);
            }
        };

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|err| {
                ModelError::new(
                    ModelErrorKind::BadResponse,
                    format!("failed to parse model response: {}", err),
                )
            });
        }

        last_error = if status.as_u16() == 429 {
            ModelError::new(ModelErrorKind::RateLimited, "model server rate limited")
        } else if status.is_server_error() {
            ModelError::new(
                ModelErrorKind::Transport,
                format!("model server returned {}", status),
            )
        } else {
            return Err(ModelError::new(
                ModelErrorKind::BadResponse,
                format!("model server returned {}", status),
            ));
        };

        sleep_with_jitter(attempt).await;
    }

    Err(last_error)
}

async fn sleep_with_jitter(attempt: u32) {
    let base_ms = 500u64 * (1 << attempt.min(4));
    let jitter_ms = rand::thread_rng().gen_range(0..base_ms / 2 + 1);
    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
}

#[derive(Debug, Serialize)]
struct EmbeddingParameters {
    input: Vec<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingInner {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct DenseEmbedData {
    data: Vec<EmbeddingInner>,
}

/// Embeds up to [`EMBED_BATCH_SIZE`] texts per request. Outbound concurrency
/// is bounded by the caller's model-pool semaphore, so requests run
/// sequentially here.
pub async fn embed_batch(
    texts: Vec<String>,
    reqwest_client: &reqwest::Client,
) -> Result<Vec<Vec<f32>>, ModelError> {
    let embedding_url = format!(
        "{}/embeddings",
        get_env!("EMBEDDING_SERVER_URL", "EMBEDDING_SERVER_URL should be set")
    );
    let model_name = get_env!("EMBEDDING_MODEL_NAME", "EMBEDDING_MODEL_NAME should be set");

    let mut all_vectors = Vec::with_capacity(texts.len());

    for batch in texts.chunks(EMBED_BATCH_SIZE) {
        let clipped: Vec<String> = batch
            .iter()
            .map(|text| text.chars().take(12000).collect())
            .collect();

        let parameters = EmbeddingParameters {
            input: clipped,
            model: model_name.to_string(),
        };

        let resp: DenseEmbedData =
            post_with_retry(reqwest_client, &embedding_url, &parameters, EMBED_TIMEOUT).await?;

        if resp.data.len() != batch.len() {
            return Err(ModelError::new(
                ModelErrorKind::BadResponse,
                format!(
                    "embedding server returned {} vectors for {} inputs",
                    resp.data.len(),
                    batch.len()
                ),
            ));
        }

        for inner in resp.data {
            if inner.embedding.is_empty() {
                return Err(ModelError::new(
                    ModelErrorKind::BadResponse,
                    "embedding server returned an empty vector",
                ));
            }
            all_vectors.push(inner.embedding);
        }
    }

    Ok(all_vectors)
}

pub async fn embed_query(
    query: String,
    reqwest_client: &reqwest::Client,
) -> Result<Vec<f32>, ModelError> {
    let mut vectors = embed_batch(vec![query], reqwest_client).await?;
    vectors.pop().ok_or(ModelError::new(
        ModelErrorKind::BadResponse,
        "no embedding returned for query",
    ))
}

pub const VLM_CORRECTION_PROMPT: &str = "
You are given a scanned document page image together with OCR output.
Correct recognition errors in the OCR text using the image as ground truth.
Keep the original reading order and line structure. Return only the corrected
plain text without commentary.
";

#[derive(Debug, Clone)]
pub struct VlmExtraction {
    pub corrected_text: String,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

/// Sends a page image plus prompt to the vision-language endpoint and
/// returns its corrected transcription.
pub async fn vlm_extract(
    image_bytes: &[u8],
    prompt: &str,
    reqwest_client: &reqwest::Client,
) -> Result<VlmExtraction, ModelError> {
    let vlm_url = format!(
        "{}/chat/completions",
        get_env!("VLM_SERVER_URL", "VLM_SERVER_URL should be set")
    );
    let model_name = get_env!("VLM_MODEL_NAME", "VLM_MODEL_NAME should be set");

    let data_url = format!(
        "data:image/png;base64,{}",
        base64::prelude::BASE64_STANDARD.encode(image_bytes)
    );

    let body = json!({
        "model": model_name,
        "max_tokens": 4096,
        "messages": [
            {
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": data_url}}
                ]
            }
        ]
    });

    let resp: ChatCompletionResponse =
        post_with_retry(reqwest_client, &vlm_url, &body, VLM_TIMEOUT).await?;

    let content = resp
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .ok_or(ModelError::new(
            ModelErrorKind::BadResponse,
            "no choices in vision response",
        ))?;

    // Vision endpoints do not report token-level confidence.
    Ok(VlmExtraction {
        corrected_text: content,
        confidence: 1.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_response_is_not_retryable() {
        let err = ModelError::new(ModelErrorKind::BadResponse, "422");
        assert!(!err.retryable());

        for kind in [
            ModelErrorKind::Timeout,
            ModelErrorKind::Transport,
            ModelErrorKind::RateLimited,
        ] {
            assert!(ModelError::new(kind, "x").retryable());
        }
    }

    #[test]
    fn model_errors_map_to_pipeline_policy() {
        let transient: PipelineError =
            ModelError::new(ModelErrorKind::Timeout, "slow").into();
        assert!(matches!(transient, PipelineError::Transient(_)));

        let permanent: PipelineError =
            ModelError::new(ModelErrorKind::BadResponse, "bad input").into();
        assert!(matches!(permanent, PipelineError::PermanentInput(_)));
    }
}
