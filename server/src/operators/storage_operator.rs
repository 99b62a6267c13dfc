use crate::{errors::ServiceError, get_env};
use rand::Rng;
use s3::{creds::Credentials, Bucket, Region};
use std::time::Duration;

const PUT_RETRIES: u32 = 3;

pub fn get_blob_bucket() -> Result<Box<Bucket>, ServiceError> {
    let s3_access_key = get_env!("S3_ACCESS_KEY", "S3_ACCESS_KEY should be set").into();
    let s3_secret_key = get_env!("S3_SECRET_KEY", "S3_SECRET_KEY should be set").into();
    let s3_endpoint = get_env!("S3_ENDPOINT", "S3_ENDPOINT should be set").into();
    let s3_bucket_name = get_env!("S3_BUCKET", "S3_BUCKET should be set");
    let aws_region_name = std::env::var("AWS_REGION").unwrap_or("".to_string());

    let aws_region = Region::Custom {
        region: aws_region_name,
        endpoint: s3_endpoint,
    };

    let aws_credentials = Credentials {
        access_key: Some(s3_access_key),
        secret_key: Some(s3_secret_key),
        security_token: None,
        session_token: None,
        expiration: None,
    };

    let aws_bucket = Bucket::new(s3_bucket_name, aws_region, aws_credentials)
        .map_err(|_| {
            ServiceError::InternalServerError("Could not create blob bucket".to_string())
        })?
        .with_path_style();

    Ok(aws_bucket)
}

/// Key for the raw uploaded bytes. Content-addressed so that byte-identical
/// uploads share one object.
pub fn raw_object_key(checksum: &str) -> String {
    format!("raw/{}", checksum)
}

pub fn page_image_key(version_id: uuid::Uuid, page_number: i32) -> String {
    format!("pages/{}/{:04}/image.png", version_id, page_number)
}

pub fn page_ocr_key(version_id: uuid::Uuid, page_number: i32) -> String {
    format!("pages/{}/{:04}/ocr.json", version_id, page_number)
}

/// Stable browser-reachable URL for an object, built from the public
/// endpoint rather than a short-lived presign.
pub fn public_object_url(key: &str) -> String {
    let base = std::env::var("S3_PUBLIC_URL")
        .ok()
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| {
            get_env!("S3_ENDPOINT", "S3_ENDPOINT should be set").to_string()
        });
    let bucket = get_env!("S3_BUCKET", "S3_BUCKET should be set");

    format!("{}/{}/{}", base.trim_end_matches('/'), bucket, key)
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 250u64 * (1 << attempt.min(6));
    let jitter_ms = rand::thread_rng().gen_range(0..base_ms / 2 + 1);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Atomic per-object put, retried with exponential backoff. Exhausting the
/// retry budget surfaces as unavailable so a running task stalls rather than
/// fails.
pub async fn put_object_retrying(
    bucket: &Bucket,
    key: &str,
    bytes: &[u8],
    content_type: &str,
) -> Result<(), ServiceError> {
    let mut last_error = String::new();
    for attempt in 0..PUT_RETRIES {
        match bucket
            .put_object_with_content_type(key, bytes, content_type)
            .await
        {
            Ok(resp) if resp.status_code() < 300 => return Ok(()),
            Ok(resp) => {
                last_error = format!("blob store returned status {}", resp.status_code());
            }
            Err(err) => {
                last_error = format!("blob store put failed: {}", err);
            }
        }
        log::warn!("put_object retry {} for {}: {}", attempt + 1, key, last_error);
        tokio::time::sleep(backoff_with_jitter(attempt)).await;
    }

    Err(ServiceError::ServiceUnavailable(last_error))
}

pub async fn get_object_retrying(bucket: &Bucket, key: &str) -> Result<Vec<u8>, ServiceError> {
    let mut last_error = String::new();
    for attempt in 0..PUT_RETRIES {
        match bucket.get_object(key).await {
            Ok(resp) if resp.status_code() < 300 => return Ok(resp.as_slice().to_vec()),
            Ok(resp) if resp.status_code() == 404 => {
                return Err(ServiceError::NotFound(format!("blob {}", key)))
            }
            Ok(resp) => {
                last_error = format!("blob store returned status {}", resp.status_code());
            }
            Err(err) => {
                last_error = format!("blob store get failed: {}", err);
            }
        }
        log::warn!("get_object retry {} for {}: {}", attempt + 1, key, last_error);
        tokio::time::sleep(backoff_with_jitter(attempt)).await;
    }

    Err(ServiceError::ServiceUnavailable(last_error))
}

/// Deletes are idempotent: a missing object is success.
pub async fn delete_object(bucket: &Bucket, key: &str) -> Result<(), ServiceError> {
    bucket.delete_object(key).await.map_err(|err| {
        ServiceError::ServiceUnavailable(format!("blob store delete failed: {}", err))
    })?;
    Ok(())
}

pub async fn presign_get_url(
    bucket: &Bucket,
    key: &str,
    ttl_secs: u32,
) -> Result<String, ServiceError> {
    bucket.presign_get(key, ttl_secs, None).await.map_err(|_| {
        ServiceError::InternalServerError("Could not presign blob url".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_stable() {
        let version = uuid::Uuid::nil();
        assert_eq!(raw_object_key("abc123"), "raw/abc123");
        assert_eq!(
            page_image_key(version, 7),
            "pages/00000000-0000-0000-0000-000000000000/0007/image.png"
        );
        assert_eq!(
            page_ocr_key(version, 7),
            "pages/00000000-0000-0000-0000-000000000000/0007/ocr.json"
        );
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_with_jitter(0);
        let fourth = backoff_with_jitter(3);
        assert!(first >= Duration::from_millis(250));
        assert!(fourth >= Duration::from_millis(2000));
    }
}
