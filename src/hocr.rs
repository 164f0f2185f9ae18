//! Reading hOCR files: word text, bounding boxes, and confidences.
//!
//! hOCR is HTML with structured `class`/`title` attributes; tesseract emits
//! one `ocrx_word` span per recognized word, with a `bbox` and an `x_wconf`
//! confidence in the title. We pull-parse with quick-xml rather than building
//! a DOM — the files can run to tens of thousands of words per page.

use std::io::BufReader;

use quick_xml::{Reader, events::Event};

use crate::prelude::*;

/// A pixel-space bounding box, hOCR convention: left, top, right, bottom.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl BBox {
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }
}

/// One recognized word.
#[derive(Clone, Debug)]
pub struct Word {
    pub text: String,
    pub bbox: BBox,
    /// Word confidence in [0,100], if the engine reported one.
    pub conf: Option<f64>,
}

/// The parsed contents of one hOCR file.
#[derive(Clone, Debug, Default)]
pub struct HocrPage {
    /// The page bounding box, from the `ocr_page` element.
    pub bbox: Option<BBox>,
    pub words: Vec<Word>,
}

impl HocrPage {
    /// Average confidence over all words that carry one. `None` means the
    /// file contains no scored words, which analysis treats as "skip this
    /// variant", not as an error.
    pub fn avg_word_conf(&self) -> Option<f64> {
        let confs: Vec<f64> = self.words.iter().filter_map(|w| w.conf).collect();
        if confs.is_empty() {
            return None;
        }
        Some(confs.iter().sum::<f64>() / confs.len() as f64)
    }
}

/// Parse an hOCR file from disk.
pub fn parse_file(path: &Path) -> Result<HocrPage> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open hOCR file {}", path.display()))?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    parse(&mut reader).with_context(|| format!("failed to parse hOCR file {}", path.display()))
}

/// Parse hOCR from a string. Mostly for tests.
pub fn parse_str(hocr: &str) -> Result<HocrPage> {
    let mut reader = Reader::from_str(hocr);
    parse(&mut reader)
}

/// Average word confidence of an hOCR file; `Ok(None)` if it has no scored
/// words.
pub fn avg_word_conf(path: &Path) -> Result<Option<f64>> {
    Ok(parse_file(path)?.avg_word_conf())
}

fn parse<R: std::io::BufRead>(reader: &mut Reader<R>) -> Result<HocrPage> {
    // hOCR is HTML; tolerate unmatched tags like <br> and <meta>.
    reader.config_mut().check_end_names = false;
    let mut page = HocrPage::default();
    let mut buf = Vec::new();

    // Set while inside an ocrx_word span: the word under construction plus
    // the nesting depth of any markup inside it (words may contain <strong>
    // and friends).
    let mut current: Option<(Word, u32)> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let class = attr_value(&e, b"class")?;
                let title = attr_value(&e, b"title")?;
                match class.as_deref() {
                    Some("ocr_page") => {
                        if let Some(title) = &title {
                            page.bbox = parse_title_bbox(title);
                        }
                    }
                    Some("ocrx_word") => {
                        let title = title.unwrap_or_default();
                        let word = Word {
                            text: String::new(),
                            bbox: parse_title_bbox(&title).unwrap_or_default(),
                            conf: parse_title_wconf(&title),
                        };
                        current = Some((word, 0));
                    }
                    _ => {
                        if let Some((_, depth)) = &mut current {
                            *depth += 1;
                        }
                    }
                }
            }
            Event::End(_) => {
                if matches!(current, Some((_, 0))) {
                    let (word, _) = current.take().expect("just matched");
                    page.words.push(word);
                } else if let Some((_, depth)) = &mut current {
                    *depth -= 1;
                }
            }
            Event::Text(t) => {
                if let Some((word, _)) = &mut current {
                    word.text.push_str(&t.unescape()?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(page)
}

/// Look up an attribute on an element, decoding it to a string.
fn attr_value(
    e: &quick_xml::events::BytesStart<'_>,
    name: &[u8],
) -> Result<Option<String>> {
    for attr in e.attributes().with_checks(false) {
        let attr = attr?;
        if attr.key.as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Extract `bbox x0 y0 x1 y1` from an hOCR title attribute.
fn parse_title_bbox(title: &str) -> Option<BBox> {
    for field in title.split(';') {
        let mut parts = field.split_whitespace();
        if parts.next() == Some("bbox") {
            let coords: Vec<u32> = parts.filter_map(|p| p.parse().ok()).collect();
            if let [x0, y0, x1, y1] = coords[..] {
                return Some(BBox { x0, y0, x1, y1 });
            }
        }
    }
    None
}

/// Extract `x_wconf N` from an hOCR title attribute.
fn parse_title_wconf(title: &str) -> Option<f64> {
    for field in title.split(';') {
        let mut parts = field.split_whitespace();
        if parts.next() == Some("x_wconf") {
            return parts.next().and_then(|p| p.parse().ok());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
 <body>
  <div class='ocr_page' id='page_1' title='image "p.png"; bbox 0 0 2400 3300; ppageno 0'>
   <div class='ocr_carea' id='block_1_1' title="bbox 100 100 2300 200">
    <p class='ocr_par' id='par_1_1' lang='eng' title="bbox 100 100 2300 200">
     <span class='ocr_line' id='line_1_1' title="bbox 100 100 2300 160">
      <span class='ocrx_word' id='word_1_1' title='bbox 100 100 300 160; x_wconf 96'>The</span>
      <span class='ocrx_word' id='word_1_2' title='bbox 320 100 700 160; x_wconf 88'><strong>Quick</strong></span>
      <span class='ocrx_word' id='word_1_3' title='bbox 720 100 900 160; x_wconf 61'>fox &amp; hen</span>
     </span>
    </p>
   </div>
  </div>
 </body>
</html>"#;

    #[test]
    fn parses_words_and_page_bbox() {
        let page = parse_str(SAMPLE).unwrap();
        assert_eq!(
            page.bbox,
            Some(BBox {
                x0: 0,
                y0: 0,
                x1: 2400,
                y1: 3300
            })
        );
        assert_eq!(page.words.len(), 3);
        assert_eq!(page.words[0].text, "The");
        assert_eq!(page.words[1].text, "Quick");
        assert_eq!(page.words[2].text, "fox & hen");
        assert_eq!(page.words[0].conf, Some(96.0));
        assert_eq!(page.words[0].bbox.width(), 200);
    }

    #[test]
    fn averages_word_confidence() {
        let page = parse_str(SAMPLE).unwrap();
        let avg = page.avg_word_conf().unwrap();
        assert!((avg - (96.0 + 88.0 + 61.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn no_words_is_none_not_an_error() {
        let empty = r#"<html><body>
          <div class='ocr_page' title='bbox 0 0 100 100'></div>
        </body></html>"#;
        let page = parse_str(empty).unwrap();
        assert!(page.avg_word_conf().is_none());
    }

    #[test]
    fn words_without_wconf_do_not_count() {
        let hocr = r#"<html><body><div class='ocr_page' title='bbox 0 0 10 10'>
          <span class='ocrx_word' title='bbox 0 0 5 5'>maybe</span>
        </div></body></html>"#;
        let page = parse_str(hocr).unwrap();
        assert_eq!(page.words.len(), 1);
        assert!(page.avg_word_conf().is_none());
    }
}
