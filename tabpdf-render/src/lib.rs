use std::convert::TryFrom;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use pdfium_render::prelude::*;
use tabpdf_core::{
    Locator, LocatorResolver, OpenedDocument, PageSize, PageSource, RenderBackend, RenderImage,
};
use tracing::{debug, instrument, warn};
use url::Url;

const LIBRARY_PATH_ENV: &str = "TABPDF_PDFIUM_LIBRARY_PATH";

pub struct PdfiumBackend {
    pdfium: Arc<Pdfium>,
}

impl PdfiumBackend {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

impl RenderBackend for PdfiumBackend {
    #[instrument(skip(self, locator), fields(%locator))]
    fn open(&self, locator: &Locator) -> Result<OpenedDocument> {
        let path = locator_path(locator)?;
        let document = self
            .pdfium
            .load_pdf_from_file(&path, None)
            .with_context(|| format!("failed to open {:?}", path))?;
        // SAFETY: the document borrows the bindings inside `self.pdfium`. The
        // source keeps its own clone of that Arc and declares `document` before
        // `pdfium`, so the document is always dropped first.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
        debug!(path = %path.display(), page_count, "pdf loaded");

        Ok(OpenedDocument {
            source: Box::new(PdfiumSource {
                document: Some(document),
                pdfium: Arc::clone(&self.pdfium),
                path,
            }),
            page_count,
        })
    }
}

struct PdfiumSource {
    document: Option<PdfDocument<'static>>,
    #[allow(dead_code)]
    pdfium: Arc<Pdfium>,
    path: PathBuf,
}

impl PdfiumSource {
    fn page(&self, page_index: usize) -> Result<PdfPage<'_>> {
        let document = self
            .document
            .as_ref()
            .ok_or_else(|| anyhow!("{:?} is already closed", self.path))?;
        let index: PdfPageIndex = page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
        document
            .pages()
            .get(index)
            .with_context(|| format!("page {} out of range", page_index))
    }
}

impl PageSource for PdfiumSource {
    fn page_size(&mut self, page_index: usize) -> Result<PageSize> {
        let page = self.page(page_index)?;
        Ok(PageSize {
            width: page.width().value,
            height: page.height().value,
        })
    }

    fn render_page(&mut self, page_index: usize, width: u32, height: u32) -> Result<RenderImage> {
        let page = self.page(page_index)?;
        let target_width = i32::try_from(width).context("target width too large")?;
        let target_height = i32::try_from(height).context("target height too large")?;
        let config = PdfRenderConfig::new().set_target_size(target_width, target_height);
        let bitmap = page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", page_index))?;
        let pixels = bitmap.as_image().to_rgba8().into_raw();

        Ok(RenderImage {
            width: u32::try_from(bitmap.width()).unwrap_or_default(),
            height: u32::try_from(bitmap.height()).unwrap_or_default(),
            pixels,
        })
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if let Some(document) = self.document.take() {
            drop(document);
            debug!(path = %self.path.display(), "pdf released");
        }
        Ok(())
    }
}

/// Names documents after their file and rejects files that have gone away.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLocatorResolver;

impl LocatorResolver for FileLocatorResolver {
    fn display_name(&self, locator: &Locator) -> Result<String> {
        let path = locator_path(locator)?;
        let metadata =
            fs::metadata(&path).with_context(|| format!("cannot access {:?}", path))?;
        if !metadata.is_file() {
            bail!("{:?} is not a file", path);
        }
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{:?} has no file name", path))
    }
}

/// Local path behind a locator. Accepts `file://` URLs and plain paths.
pub fn locator_path(locator: &Locator) -> Result<PathBuf> {
    let raw = locator.as_str();
    match Url::parse(raw) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map_err(|_| anyhow!("locator {} does not name a local file", raw)),
        // Single letter schemes are Windows drive prefixes.
        Ok(url) if url.scheme().len() > 1 => {
            bail!("unsupported locator scheme {:?}", url.scheme())
        }
        _ => Ok(PathBuf::from(raw)),
    }
}

/// The `file://` locator for `path`, made absolute first.
pub fn locator_for_path(path: &Path) -> Result<Locator> {
    let absolute = path
        .canonicalize()
        .with_context(|| format!("failed to resolve path for {:?}", path))?;
    let url = Url::from_file_path(&absolute)
        .map_err(|_| anyhow!("{:?} cannot be expressed as a file URL", absolute))?;
    Ok(Locator::parse(String::from(url))?)
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    let path = std::env::var_os(LIBRARY_PATH_ENV)?;
    if path.is_empty() {
        return None;
    }
    match Pdfium::bind_to_library(&path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!(
                "failed to load Pdfium from {} ({:?}): {}",
                LIBRARY_PATH_ENV, path, err
            );
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; set {} or install it ({})",
                LIBRARY_PATH_ENV,
                errors.join(", ")
            ))
        }
    }
}
