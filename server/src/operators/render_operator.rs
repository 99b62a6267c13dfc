use crate::{errors::PipelineError, get_env};
use std::io::{Cursor, Read};
use std::time::Duration;

const CONVERT_TIMEOUT: Duration = Duration::from_secs(120);
const RENDER_DPI: u32 = 300;
/// Character budget per synthesized page for plain-text uploads.
const TEXT_PAGE_CHARS: usize = 3000;

/// Tagged variant over the supported upload formats. Office formats route
/// through the external converter to a paginated PDF first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVariant {
    Pdf,
    Word,
    Presentation,
    Spreadsheet,
    Text,
    Image,
    Archive,
}

impl FileVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileVariant::Pdf => "pdf",
            FileVariant::Word => "word",
            FileVariant::Presentation => "presentation",
            FileVariant::Spreadsheet => "spreadsheet",
            FileVariant::Text => "text",
            FileVariant::Image => "image",
            FileVariant::Archive => "archive",
        }
    }

    pub fn from_file_type(file_type: &str) -> Option<FileVariant> {
        match file_type {
            "pdf" => Some(FileVariant::Pdf),
            "word" => Some(FileVariant::Word),
            "presentation" => Some(FileVariant::Presentation),
            "spreadsheet" => Some(FileVariant::Spreadsheet),
            "text" => Some(FileVariant::Text),
            "image" => Some(FileVariant::Image),
            "archive" => Some(FileVariant::Archive),
            _ => None,
        }
    }
}

pub fn detect_variant(filename: &str) -> Option<FileVariant> {
    let extension = filename.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())?;

    match extension.as_str() {
        "pdf" => Some(FileVariant::Pdf),
        "doc" | "docx" | "odt" | "rtf" => Some(FileVariant::Word),
        "ppt" | "pptx" | "odp" => Some(FileVariant::Presentation),
        "xls" | "xlsx" | "ods" | "csv" => Some(FileVariant::Spreadsheet),
        "txt" | "md" | "markdown" => Some(FileVariant::Text),
        "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" | "webp" => Some(FileVariant::Image),
        "zip" => Some(FileVariant::Archive),
        _ => None,
    }
}

/// One ordered page produced by the render capability.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page_number: i32,
    pub image_png: Vec<u8>,
    pub native_text: Option<String>,
}

fn encode_png(img: &image::DynamicImage) -> Result<Vec<u8>, PipelineError> {
    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
        .map_err(|err| PipelineError::Transient(format!("failed to encode page image: {}", err)))?;
    Ok(buffer)
}

/// Placeholder page raster for formats that have no visual layer.
fn synthetic_page_image() -> Result<Vec<u8>, PipelineError> {
    let blank = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        8,
        8,
        image::Rgb([255, 255, 255]),
    ));
    encode_png(&blank)
}

fn render_pdf(bytes: &[u8]) -> Result<Vec<RenderedPage>, PipelineError> {
    let pdf = pdf2image::PDF::from_bytes(bytes.to_vec())
        .map_err(|err| PipelineError::PermanentInput(format!("could not load pdf: {}", err)))?;

    let options = pdf2image::RenderOptionsBuilder::default()
        .resolution(pdf2image::DPI::Uniform(RENDER_DPI))
        .build()
        .map_err(|err| PipelineError::Transient(format!("render options: {}", err)))?;

    let images = pdf
        .render(pdf2image::Pages::All, options)
        .map_err(|err| PipelineError::PermanentInput(format!("could not render pdf: {}", err)))?;

    if images.is_empty() {
        return Err(PipelineError::PermanentInput("empty document".to_string()));
    }

    // The text layer comes straight from the PDF when one exists.
    let native_doc = lopdf::Document::load_mem(bytes).ok();

    let mut pages = Vec::with_capacity(images.len());
    for (index, img) in images.into_iter().enumerate() {
        let page_number = index as i32 + 1;
        let native_text = native_doc
            .as_ref()
            .and_then(|doc| doc.extract_text(&[page_number as u32]).ok())
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());

        pages.push(RenderedPage {
            page_number,
            image_png: encode_png(&img)?,
            native_text,
        });
    }

    Ok(pages)
}

/// Headless office-to-PDF conversion through the external converter
/// capability.
async fn convert_office_to_pdf(
    bytes: Vec<u8>,
    reqwest_client: &reqwest::Client,
) -> Result<Vec<u8>, PipelineError> {
    let converter_url = format!(
        "{}/convert",
        get_env!("OFFICE_CONVERTER_URL", "OFFICE_CONVERTER_URL should be set")
    );

    let resp = reqwest_client
        .post(&converter_url)
        .timeout(CONVERT_TIMEOUT)
        .header("Accept", "application/pdf")
        .body(bytes)
        .send()
        .await
        .map_err(|err| PipelineError::Transient(format!("converter unreachable: {}", err)))?;

    if resp.status().is_client_error() {
        return Err(PipelineError::PermanentInput(format!(
            "converter rejected document: {}",
            resp.status()
        )));
    }
    if !resp.status().is_success() {
        return Err(PipelineError::Transient(format!(
            "converter returned {}",
            resp.status()
        )));
    }

    let pdf_bytes = resp
        .bytes()
        .await
        .map_err(|err| PipelineError::Transient(format!("converter read failed: {}", err)))?;

    Ok(pdf_bytes.to_vec())
}

fn render_text(bytes: &[u8]) -> Result<Vec<RenderedPage>, PipelineError> {
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() {
        return Err(PipelineError::PermanentInput("empty document".to_string()));
    }

    let chars: Vec<char> = text.chars().collect();
    let mut pages = vec![];
    for (index, window) in chars.chunks(TEXT_PAGE_CHARS).enumerate() {
        pages.push(RenderedPage {
            page_number: index as i32 + 1,
            image_png: synthetic_page_image()?,
            native_text: Some(window.iter().collect::<String>().trim().to_string()),
        });
    }

    Ok(pages)
}

fn render_image(bytes: &[u8]) -> Result<Vec<RenderedPage>, PipelineError> {
    let img = image::load_from_memory(bytes)
        .map_err(|err| PipelineError::PermanentInput(format!("unreadable image: {}", err)))?;

    Ok(vec![RenderedPage {
        page_number: 1,
        image_png: encode_png(&img)?,
        native_text: None,
    }])
}

/// Produces the ordered page sequence for a single (non-archive) upload.
pub async fn render_pages(
    bytes: Vec<u8>,
    variant: FileVariant,
    reqwest_client: &reqwest::Client,
) -> Result<Vec<RenderedPage>, PipelineError> {
    match variant {
        FileVariant::Pdf => render_pdf(&bytes),
        FileVariant::Word | FileVariant::Presentation | FileVariant::Spreadsheet => {
            let pdf_bytes = convert_office_to_pdf(bytes, reqwest_client).await?;
            render_pdf(&pdf_bytes)
        }
        FileVariant::Text => render_text(&bytes),
        FileVariant::Image => render_image(&bytes),
        FileVariant::Archive => Err(PipelineError::Invariant(
            "archives are expanded into child uploads before rendering".to_string(),
        )),
    }
}

/// Expands an archive into its supported member files. Each entry becomes a
/// dependent child upload.
pub fn list_archive_entries(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, PipelineError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| PipelineError::PermanentInput(format!("unreadable archive: {}", err)))?;

    let mut entries = vec![];
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| PipelineError::PermanentInput(format!("bad archive entry: {}", err)))?;

        if entry.is_dir() {
            continue;
        }

        let name = entry
            .name()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        if name.starts_with('.') || name.starts_with("__MACOSX") {
            continue;
        }

        match detect_variant(&name) {
            Some(FileVariant::Archive) | None => continue,
            Some(_) => {}
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data).map_err(|err| {
            PipelineError::PermanentInput(format!("could not read archive entry: {}", err))
        })?;
        entries.push((name, data));
    }

    if entries.is_empty() {
        return Err(PipelineError::PermanentInput(
            "archive contains no supported documents".to_string(),
        ));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_detection_by_extension() {
        assert_eq!(detect_variant("manual.pdf"), Some(FileVariant::Pdf));
        assert_eq!(detect_variant("Report.DOCX"), Some(FileVariant::Word));
        assert_eq!(detect_variant("deck.pptx"), Some(FileVariant::Presentation));
        assert_eq!(detect_variant("sheet.xlsx"), Some(FileVariant::Spreadsheet));
        assert_eq!(detect_variant("notes.md"), Some(FileVariant::Text));
        assert_eq!(detect_variant("scan.jpeg"), Some(FileVariant::Image));
        assert_eq!(detect_variant("bundle.zip"), Some(FileVariant::Archive));
        assert_eq!(detect_variant("program.exe"), None);
        assert_eq!(detect_variant("no_extension"), None);
    }

    #[test]
    fn variant_string_round_trip() {
        for variant in [
            FileVariant::Pdf,
            FileVariant::Word,
            FileVariant::Presentation,
            FileVariant::Spreadsheet,
            FileVariant::Text,
            FileVariant::Image,
            FileVariant::Archive,
        ] {
            assert_eq!(FileVariant::from_file_type(variant.as_str()), Some(variant));
        }
    }

    #[test]
    fn text_renders_into_page_sized_blocks() {
        let body = "reset procedure. ".repeat(400);
        let pages = render_text(body.as_bytes()).unwrap();

        assert!(pages.len() >= 2);
        for (index, page) in pages.iter().enumerate() {
            assert_eq!(page.page_number, index as i32 + 1);
            assert!(page.native_text.as_ref().is_some_and(|t| !t.is_empty()));
            assert!(!page.image_png.is_empty());
        }
    }

    #[test]
    fn empty_text_is_a_permanent_input_error() {
        let err = render_text(b"   \n ").unwrap_err();
        assert!(matches!(err, PipelineError::PermanentInput(_)));
    }
}
