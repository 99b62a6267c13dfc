use crate::{
    data::models::{BoundingBox, OcrEngine},
    errors::PipelineError,
    get_env,
};
use base64::Engine as _;
use serde::Serialize;
use std::io::Cursor;
use std::time::Duration;

const OCR_TIMEOUT: Duration = Duration::from_secs(60);
const OCR_RETRIES: u32 = 3;

pub fn deep_ocr_threshold() -> f64 {
    std::env::var("DEEP_OCR_THRESHOLD")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.5)
}

fn engine_url(engine: OcrEngine) -> &'static str {
    match engine {
        OcrEngine::Paddle => get_env!("OCR_PADDLE_URL", "OCR_PADDLE_URL should be set"),
        OcrEngine::Tesseract => get_env!("OCR_TESSERACT_URL", "OCR_TESSERACT_URL should be set"),
    }
}

#[derive(Debug, Serialize)]
struct OcrRequest {
    image: String,
}

/// Runs one OCR pass over a page image through the configured engine
/// capability. The engine returns detected text spans with page-space
/// rectangles and confidences.
pub async fn run_ocr(
    image_png: &[u8],
    engine: OcrEngine,
    reqwest_client: &reqwest::Client,
) -> Result<Vec<BoundingBox>, PipelineError> {
    let url = format!("{}/ocr", engine_url(engine));
    let request = OcrRequest {
        image: base64::prelude::BASE64_STANDARD.encode(image_png),
    };

    let mut last_error = String::new();
    for attempt in 0..OCR_RETRIES {
        let result = reqwest_client
            .post(&url)
            .timeout(OCR_TIMEOUT)
            .json(&request)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                return resp.json::<Vec<BoundingBox>>().await.map_err(|err| {
                    PipelineError::Transient(format!("malformed ocr response: {}", err))
                });
            }
            Ok(resp) if resp.status().is_client_error() => {
                return Err(PipelineError::PermanentInput(format!(
                    "ocr engine rejected page: {}",
                    resp.status()
                )));
            }
            Ok(resp) => {
                last_error = format!("ocr engine returned {}", resp.status());
            }
            Err(err) => {
                last_error = format!("ocr engine unreachable: {}", err);
            }
        }

        log::warn!("ocr retry {}: {}", attempt + 1, last_error);
        tokio::time::sleep(Duration::from_millis(500 * (attempt as u64 + 1))).await;
    }

    Err(PipelineError::Transient(last_error))
}

/// Reading order for overlapping detections: top-to-bottom by box center y,
/// then left-to-right by center x.
pub fn layout_sort(boxes: &mut [BoundingBox]) {
    boxes.sort_by(|a, b| {
        let (ax, ay) = a.center();
        let (bx, by) = b.center();
        ay.partial_cmp(&by)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(ax.partial_cmp(&bx).unwrap_or(std::cmp::Ordering::Equal))
    });
}

pub fn average_confidence(boxes: &[BoundingBox]) -> f64 {
    if boxes.is_empty() {
        return 0.0;
    }
    boxes.iter().map(|b| b.confidence).sum::<f64>() / boxes.len() as f64
}

/// Joins layout-sorted boxes into page text. Boxes whose vertical centers
/// sit within half the average box height are treated as one line.
pub fn joined_text(boxes: &[BoundingBox]) -> String {
    if boxes.is_empty() {
        return String::new();
    }

    let avg_height = boxes
        .iter()
        .map(|b| (b.bbox[3] - b.bbox[1]).abs())
        .sum::<f64>()
        / boxes.len() as f64;
    let line_tolerance = (avg_height / 2.0).max(1.0);

    let mut lines: Vec<String> = vec![];
    let mut current_line = String::new();
    let mut current_y = f64::MIN;

    for bbox in boxes {
        let (_, cy) = bbox.center();
        if current_line.is_empty() || (cy - current_y).abs() <= line_tolerance {
            if !current_line.is_empty() {
                current_line.push(' ');
            }
            current_line.push_str(bbox.text.trim());
        } else {
            lines.push(std::mem::take(&mut current_line));
            current_line.push_str(bbox.text.trim());
        }
        current_y = cy;
    }

    if !current_line.is_empty() {
        lines.push(current_line);
    }

    lines.join("\n")
}

fn encode_png(img: &image::DynamicImage) -> Result<Vec<u8>, PipelineError> {
    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
        .map_err(|err| PipelineError::Transient(format!("failed to encode region: {}", err)))?;
    Ok(buffer)
}

/// Deep-mode second pass: regions below the confidence threshold are
/// cropped from the full-resolution image and re-OCRed individually. The
/// replacement keeps the original rectangle but takes the sharper pass's
/// text whenever it is more confident.
pub async fn reocr_low_confidence_regions(
    full_res_png: &[u8],
    boxes: Vec<BoundingBox>,
    scale: f64,
    engine: OcrEngine,
    reqwest_client: &reqwest::Client,
) -> Result<Vec<BoundingBox>, PipelineError> {
    let threshold = deep_ocr_threshold();
    if boxes.iter().all(|b| b.confidence >= threshold) {
        return Ok(boxes);
    }

    let full_image = image::load_from_memory(full_res_png)
        .map_err(|err| PipelineError::PermanentInput(format!("unreadable page image: {}", err)))?;
    let (width, height) = (full_image.width() as f64, full_image.height() as f64);

    let mut refined = Vec::with_capacity(boxes.len());
    for mut bbox in boxes {
        if bbox.confidence >= threshold {
            refined.push(bbox);
            continue;
        }

        let x1 = (bbox.bbox[0] * scale).clamp(0.0, width - 1.0);
        let y1 = (bbox.bbox[1] * scale).clamp(0.0, height - 1.0);
        let x2 = (bbox.bbox[2] * scale).clamp(x1 + 1.0, width);
        let y2 = (bbox.bbox[3] * scale).clamp(y1 + 1.0, height);

        let region = full_image.crop_imm(
            x1 as u32,
            y1 as u32,
            (x2 - x1) as u32,
            (y2 - y1) as u32,
        );

        let region_png = encode_png(&region)?;
        let mut region_boxes = run_ocr(&region_png, engine, reqwest_client).await?;
        layout_sort(&mut region_boxes);

        let region_text = region_boxes
            .iter()
            .map(|b| b.text.trim())
            .collect::<Vec<_>>()
            .join(" ");
        let region_confidence = average_confidence(&region_boxes);

        if !region_text.is_empty() && region_confidence > bbox.confidence {
            bbox.text = region_text;
            bbox.confidence = region_confidence;
        }

        refined.push(bbox);
    }

    Ok(refined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(text: &str, confidence: f64, rect: [f64; 4]) -> BoundingBox {
        BoundingBox {
            text: text.to_string(),
            confidence,
            bbox: rect,
        }
    }

    #[test]
    fn layout_sort_is_top_to_bottom_then_left_to_right() {
        let mut boxes = vec![
            bbox("right", 0.9, [100.0, 10.0, 140.0, 20.0]),
            bbox("below", 0.9, [0.0, 40.0, 40.0, 50.0]),
            bbox("left", 0.9, [0.0, 10.0, 40.0, 20.0]),
        ];
        layout_sort(&mut boxes);

        let order: Vec<&str> = boxes.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(order, vec!["left", "right", "below"]);
    }

    #[test]
    fn layout_sort_breaks_y_ties_by_x() {
        let mut boxes = vec![
            bbox("b", 0.9, [50.0, 10.0, 60.0, 20.0]),
            bbox("a", 0.9, [10.0, 10.0, 20.0, 20.0]),
        ];
        layout_sort(&mut boxes);
        assert_eq!(boxes[0].text, "a");
        assert_eq!(boxes[1].text, "b");
    }

    #[test]
    fn average_confidence_handles_empty() {
        assert_eq!(average_confidence(&[]), 0.0);

        let boxes = vec![
            bbox("a", 0.4, [0.0, 0.0, 1.0, 1.0]),
            bbox("b", 0.8, [0.0, 2.0, 1.0, 3.0]),
        ];
        assert!((average_confidence(&boxes) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn joined_text_groups_lines() {
        let boxes = vec![
            bbox("reset", 0.9, [0.0, 10.0, 30.0, 20.0]),
            bbox("procedure", 0.9, [35.0, 10.0, 90.0, 20.0]),
            bbox("step one", 0.9, [0.0, 40.0, 60.0, 50.0]),
        ];
        assert_eq!(joined_text(&boxes), "reset procedure\nstep one");
        assert_eq!(joined_text(&[]), "");
    }
}
