//! Searchable PDF assembly: one page image plus an invisible hOCR text
//! layer per page.
//!
//! printpdf 0.8 uses a data-oriented API: documents are built by
//! constructing `PdfPage` structs containing `Vec<Op>` operation lists,
//! then serialised via `PdfDocument::save()`. The text layer is written in
//! invisible rendering mode at the hOCR word boxes, so selecting or
//! searching the PDF hits the OCR text while the reader sees the scan.

use printpdf::{
    BuiltinFont, Mm, Op, PdfDocument, PdfPage, PdfSaveOptions, PdfWarnMsg, Point, Pt,
    RawImage, RawImageData, RawImageFormat, TextItem, TextRenderingMode, XObjectTransform,
};

use crate::{hocr, prelude::*};

/// Assumed resolution of scanned page images.
const DPI: f32 = 300.0;

/// Builds a searchable PDF one page at a time.
pub struct SearchablePdf {
    doc: PdfDocument,
    pages: Vec<PdfPage>,
}

impl SearchablePdf {
    /// Create an empty document titled `title`.
    pub fn new(title: &str) -> Self {
        Self {
            doc: PdfDocument::new(title),
            pages: Vec::new(),
        }
    }

    /// Number of pages added so far.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Add one page: the image at `img_path` with the text layer from
    /// `hocr_path`.
    #[instrument(level = "debug", skip(self), fields(img = %img_path.display()))]
    pub fn add_page(&mut self, img_path: &Path, hocr_path: &Path) -> Result<()> {
        let dynamic_image = image::open(img_path)
            .with_context(|| format!("failed to decode page image {}", img_path.display()))?;
        let img_width = dynamic_image.width() as usize;
        let img_height = dynamic_image.height() as usize;

        let rgb_image = dynamic_image.to_rgb8();
        let raw = RawImage {
            pixels: RawImageData::U8(rgb_image.into_raw()),
            width: img_width,
            height: img_height,
            data_format: RawImageFormat::RGB8,
            tag: Vec::new(),
        };
        let xobject_id = self.doc.add_image(&raw);

        // Page sized to the image at the assumed scan resolution.
        let page_w_pt = img_width as f32 / DPI * 72.0;
        let page_h_pt = img_height as f32 / DPI * 72.0;

        let mut ops = vec![Op::UseXobject {
            id: xobject_id,
            transform: XObjectTransform {
                translate_x: Some(Pt(0.0)),
                translate_y: Some(Pt(0.0)),
                scale_x: Some(1.0),
                scale_y: Some(1.0),
                dpi: Some(DPI),
                rotate: None,
            },
        }];

        let hocr_page = hocr::parse_file(hocr_path)?;
        // Word boxes are in the hOCR page's pixel space, which may not match
        // the image we are placing (colour originals versus binarized
        // variants can differ in resolution).
        let (src_w, src_h) = match hocr_page.bbox {
            Some(bbox) if bbox.width() > 0 && bbox.height() > 0 => {
                (bbox.width() as f32, bbox.height() as f32)
            }
            _ => (img_width as f32, img_height as f32),
        };
        let scale_x = page_w_pt / src_w;
        let scale_y = page_h_pt / src_h;

        for word in &hocr_page.words {
            if word.text.is_empty() || word.bbox.height() == 0 {
                continue;
            }
            let font_size_pt = word.bbox.height() as f32 * scale_y;
            let x_pt = word.bbox.x0 as f32 * scale_x;
            // PDF origin is bottom-left; hOCR's is top-left.
            let y_pt = page_h_pt - word.bbox.y1 as f32 * scale_y;

            ops.push(Op::StartTextSection);
            ops.push(Op::SetTextRenderingMode {
                mode: TextRenderingMode::Invisible,
            });
            ops.push(Op::SetTextCursor {
                pos: Point {
                    x: Pt(x_pt),
                    y: Pt(y_pt),
                },
            });
            ops.push(Op::SetFontSizeBuiltinFont {
                size: Pt(font_size_pt),
                font: BuiltinFont::Helvetica,
            });
            ops.push(Op::WriteTextBuiltinFont {
                items: vec![TextItem::Text(word.text.clone())],
                font: BuiltinFont::Helvetica,
            });
            ops.push(Op::EndTextSection);
        }

        self.pages.push(PdfPage::new(
            Mm(page_w_pt * 25.4 / 72.0),
            Mm(page_h_pt * 25.4 / 72.0),
            ops,
        ));
        Ok(())
    }

    /// Serialise the document to `path`. Callers are expected to skip saving
    /// documents with no pages; see [`SearchablePdf::page_count`].
    pub fn save(mut self, path: &Path) -> Result<()> {
        let pages = std::mem::take(&mut self.pages);
        self.doc.with_pages(pages);
        let mut warnings: Vec<PdfWarnMsg> = Vec::new();
        let bytes = self.doc.save(&PdfSaveOptions::default(), &mut warnings);
        std::fs::write(path, &bytes)
            .with_context(|| format!("failed to write PDF {}", path.display()))?;
        Ok(())
    }
}
