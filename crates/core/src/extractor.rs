use crate::error::ExtractionError;
use crate::models::{
    Chunk, ChunkDetail, ChunkKind, ImageRecord, ParagraphRecord, ParsedContent, TableRecord,
};
use crate::ocr::OcrAdapter;
use crate::text::{char_len, clean_text, make_chunk_id, text_features};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Paragraph and table chunks shorter than this are dropped.
pub const MIN_TEXT_CHARS: usize = 10;
/// OCR text shorter than this is dropped.
pub const MIN_OCR_CHARS: usize = 6;

/// A record that failed extraction and was left out of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    pub kind: ChunkKind,
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub chunks: Vec<Chunk>,
    pub skipped: Vec<SkippedRecord>,
    /// Records that were valid but too short to keep.
    pub dropped: usize,
}

impl ExtractionReport {
    fn skip(&mut self, kind: ChunkKind, index: usize, error: ExtractionError) {
        warn!(%kind, index, error = %error, "skipping content record");
        self.skipped.push(SkippedRecord {
            kind,
            index,
            reason: error.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlattenedTable {
    pub text: String,
    pub row_count: usize,
    pub column_count: usize,
    pub numeric: bool,
}

/// Turns parsed paragraphs, images and tables into chunks.
#[derive(Clone, Default)]
pub struct ChunkExtractor {
    ocr: Option<OcrAdapter>,
}

impl ChunkExtractor {
    pub fn new(ocr: Option<OcrAdapter>) -> Self {
        Self { ocr }
    }

    /// Extracts every record independently; a failing record is logged and skipped.
    pub async fn extract(&self, document_id: &str, content: &ParsedContent) -> ExtractionReport {
        let mut report = ExtractionReport::default();

        for (index, record) in content.paragraphs.iter().enumerate() {
            match paragraph_chunk(document_id, index, record) {
                Some(chunk) => report.chunks.push(chunk),
                None => report.dropped += 1,
            }
        }

        self.extract_images(document_id, &content.images, &mut report)
            .await;

        for (index, record) in content.tables.iter().enumerate() {
            match table_chunk(document_id, index, record) {
                Ok(Some(chunk)) => report.chunks.push(chunk),
                Ok(None) => report.dropped += 1,
                Err(error) => report.skip(ChunkKind::Table, index, error),
            }
        }

        debug!(
            document_id,
            chunks = report.chunks.len(),
            skipped = report.skipped.len(),
            dropped = report.dropped,
            "extraction finished"
        );
        report
    }

    async fn extract_images(
        &self,
        document_id: &str,
        images: &[ImageRecord],
        report: &mut ExtractionReport,
    ) {
        let mut pending = Vec::new();
        for (index, record) in images.iter().enumerate() {
            match &record.data {
                Some(data) if !data.is_empty() => pending.push((index, data.clone())),
                _ => report.skip(ChunkKind::Image, index, ExtractionError::MissingImageData),
            }
        }

        if pending.is_empty() {
            return;
        }

        let Some(ocr) = &self.ocr else {
            for (index, _) in pending {
                report.skip(ChunkKind::Image, index, ExtractionError::OcrUnavailable);
            }
            return;
        };

        let (indices, data): (Vec<usize>, Vec<Vec<u8>>) = pending.into_iter().unzip();
        let outcomes = ocr.recognize_batch(data).await;

        for (index, outcome) in indices.into_iter().zip(outcomes) {
            match outcome {
                Ok(recognition) => {
                    let content = clean_text(&recognition.text);
                    if char_len(&content) < MIN_OCR_CHARS {
                        report.dropped += 1;
                        continue;
                    }
                    let record = &images[index];
                    let page_number = page_or_default(record.page_number);
                    report.chunks.push(Chunk {
                        id: make_chunk_id(document_id, ChunkKind::Image, index, page_number, &content),
                        document_id: document_id.to_string(),
                        features: text_features(&content),
                        content,
                        page_number,
                        position: record.position,
                        detail: ChunkDetail::Image {
                            ocr_confidence: recognition.confidence,
                        },
                    });
                }
                Err(error) => report.skip(ChunkKind::Image, index, error),
            }
        }
    }
}

/// Missing or zero page numbers count as page 1 for every kind.
pub fn page_or_default(page_number: Option<u32>) -> u32 {
    page_number.filter(|page| *page > 0).unwrap_or(1)
}

pub fn paragraph_chunk(document_id: &str, index: usize, record: &ParagraphRecord) -> Option<Chunk> {
    let content = clean_text(&record.text);
    if char_len(&content) < MIN_TEXT_CHARS {
        return None;
    }

    let page_number = page_or_default(record.page_number);
    Some(Chunk {
        id: make_chunk_id(document_id, ChunkKind::Paragraph, index, page_number, &content),
        document_id: document_id.to_string(),
        features: text_features(&content),
        content,
        page_number,
        position: record.position,
        detail: ChunkDetail::Paragraph,
    })
}

pub fn table_chunk(
    document_id: &str,
    index: usize,
    record: &TableRecord,
) -> Result<Option<Chunk>, ExtractionError> {
    let table = flatten_table(record)?;
    if char_len(&table.text) < MIN_TEXT_CHARS {
        return Ok(None);
    }

    let page_number = page_or_default(record.page_number);
    let has_caption = record
        .caption
        .as_deref()
        .is_some_and(|caption| !caption.trim().is_empty());

    Ok(Some(Chunk {
        id: make_chunk_id(document_id, ChunkKind::Table, index, page_number, &table.text),
        document_id: document_id.to_string(),
        features: text_features(&table.text),
        content: table.text,
        page_number,
        position: record.position,
        detail: ChunkDetail::Table {
            row_count: table.row_count,
            column_count: table.column_count,
            numeric: table.numeric,
            has_caption,
        },
    }))
}

/// Renders a table as `Headers: ...`, one `Row N: ...` line per row and `Caption: ...`.
pub fn flatten_table(record: &TableRecord) -> Result<FlattenedTable, ExtractionError> {
    let mut lines = Vec::new();
    let mut column_count = 0;
    let mut cells_total = 0usize;
    let mut cells_numeric = 0usize;

    let headers: Vec<String> = record.headers.iter().map(cell_text).collect();
    if !headers.is_empty() {
        column_count = headers.len();
        lines.push(format!("Headers: {}", headers.join(", ")));
    }

    for (row_index, row) in record.rows.iter().enumerate() {
        let cells: Vec<String> = match row {
            Value::Array(values) => values.iter().map(cell_text).collect(),
            Value::Object(map) => object_cells(map, &headers),
            other => {
                return Err(ExtractionError::MalformedTable(format!(
                    "row {} is neither an array nor an object: {other}",
                    row_index + 1
                )))
            }
        };

        column_count = column_count.max(cells.len());
        for cell in cells.iter().filter(|cell| !cell.is_empty()) {
            cells_total += 1;
            if is_numeric_cell(cell) {
                cells_numeric += 1;
            }
        }
        lines.push(format!("Row {}: {}", row_index + 1, cells.join(", ")));
    }

    if let Some(caption) = record.caption.as_deref().map(str::trim) {
        if !caption.is_empty() {
            lines.push(format!("Caption: {caption}"));
        }
    }

    Ok(FlattenedTable {
        text: lines.join("\n"),
        row_count: record.rows.len(),
        column_count,
        numeric: cells_total > 0 && cells_numeric * 2 > cells_total,
    })
}

/// Cells of a keyed row, in header order first. Keys that name no header follow in the order
/// the parser wrote them.
fn object_cells(row: &Map<String, Value>, headers: &[String]) -> Vec<String> {
    let mut used = vec![false; row.len()];
    let mut cells = Vec::with_capacity(row.len());

    for header in headers {
        let slot = row
            .keys()
            .position(|key| key == header)
            .or_else(|| row.keys().position(|key| key.eq_ignore_ascii_case(header)))
            .filter(|slot| !used[*slot]);
        match slot {
            Some(slot) => {
                used[slot] = true;
                cells.extend(row.values().nth(slot).map(cell_text));
            }
            None => cells.push(String::new()),
        }
    }

    cells.extend(
        row.values()
            .zip(used)
            .filter(|(_, used)| !used)
            .map(|(value, _)| cell_text(value)),
    );
    cells
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.trim().to_string(),
        other => other.to_string(),
    }
}

fn is_numeric_cell(cell: &str) -> bool {
    let stripped: String = cell
        .chars()
        .filter(|ch| !matches!(ch, ',' | '%' | '$' | ' '))
        .collect();
    !stripped.is_empty() && stripped.parse::<f64>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::traits::{OcrEngine, OcrOutput};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct ScriptedOcr;

    #[async_trait]
    impl OcrEngine for ScriptedOcr {
        async fn recognize(&self, image: &[u8]) -> Result<OcrOutput, BackendError> {
            match image {
                b"fail" => Err(BackendError::Unavailable("ocr offline".to_string())),
                b"tiny" => Ok(OcrOutput {
                    text: "ab c".to_string(),
                    confidence: 40.0,
                }),
                other => Ok(OcrOutput {
                    text: String::from_utf8_lossy(other).to_string(),
                    confidence: 91.0,
                }),
            }
        }
    }

    fn paragraph(text: &str, page: Option<u32>) -> ParagraphRecord {
        ParagraphRecord {
            text: text.to_string(),
            page_number: page,
            position: None,
        }
    }

    #[test]
    fn short_paragraphs_are_dropped() {
        assert!(paragraph_chunk("doc", 0, &paragraph("  tiny  ", None)).is_none());
        assert!(paragraph_chunk("doc", 0, &paragraph("\u{2022}\u{2022} ab !!!!", None)).is_none());
    }

    #[test]
    fn paragraph_defaults_to_first_page() {
        let chunk = paragraph_chunk(
            "doc",
            0,
            &paragraph("The quick brown fox jumps over the lazy dog", None),
        )
        .unwrap();
        assert_eq!(chunk.page_number, 1);
        assert_eq!(chunk.kind(), ChunkKind::Paragraph);
        assert_eq!(chunk.features.word_count, 9);
        assert!(chunk.ocr_confidence().is_none());
    }

    #[test]
    fn table_flattens_headers_rows_and_caption() {
        let record = TableRecord {
            headers: vec![json!("A"), json!("B")],
            rows: vec![json!(["1", "2"]), json!({"a": 3, "b": "4"})],
            caption: Some(" Totals ".to_string()),
            page_number: Some(2),
            position: None,
        };

        let table = flatten_table(&record).unwrap();
        assert_eq!(
            table.text,
            "Headers: A, B\nRow 1: 1, 2\nRow 2: 3, 4\nCaption: Totals"
        );
        assert_eq!(table.row_count, 2);
        assert_eq!(table.column_count, 2);
        assert!(table.numeric);

        let chunk = table_chunk("doc", 0, &record).unwrap().unwrap();
        assert_eq!(chunk.page_number, 2);
        assert!(matches!(
            chunk.detail,
            ChunkDetail::Table {
                row_count: 2,
                column_count: 2,
                numeric: true,
                has_caption: true
            }
        ));
    }

    #[test]
    fn keyed_rows_keep_column_order() {
        let headerless = TableRecord {
            rows: vec![json!({"zeta": "first", "alpha": "second"})],
            ..TableRecord::default()
        };
        assert_eq!(flatten_table(&headerless).unwrap().text, "Row 1: first, second");

        let headed = TableRecord {
            headers: vec![json!("Region"), json!("Amount"), json!("Notes")],
            rows: vec![json!({"amount": "12", "extra": "x", "region": "North"})],
            ..TableRecord::default()
        };
        let table = flatten_table(&headed).unwrap();
        assert_eq!(
            table.text,
            "Headers: Region, Amount, Notes\nRow 1: North, 12, , x"
        );
        assert_eq!(table.column_count, 4);
    }

    #[test]
    fn malformed_table_row_is_an_error() {
        let record = TableRecord {
            rows: vec![json!(["ok", "row"]), json!(42)],
            ..TableRecord::default()
        };
        assert!(matches!(
            flatten_table(&record),
            Err(ExtractionError::MalformedTable(_))
        ));
    }

    #[tokio::test]
    async fn one_bad_record_does_not_abort_extraction() {
        let extractor = ChunkExtractor::new(Some(OcrAdapter::new(Arc::new(ScriptedOcr), 2)));
        let content = ParsedContent {
            paragraphs: vec![
                paragraph("Hydraulic pressure must stay below 12 bar.", Some(3)),
                paragraph("short", Some(1)),
            ],
            images: vec![
                ImageRecord {
                    data: Some(b"Scanned warranty card".to_vec()),
                    page_number: Some(4),
                    position: None,
                },
                ImageRecord {
                    data: Some(b"fail".to_vec()),
                    page_number: Some(4),
                    position: None,
                },
                ImageRecord {
                    data: Some(b"tiny".to_vec()),
                    page_number: None,
                    position: None,
                },
                ImageRecord::default(),
            ],
            tables: vec![
                TableRecord {
                    rows: vec![json!("not a row")],
                    ..TableRecord::default()
                },
                TableRecord {
                    headers: vec![json!("Part"), json!("Qty")],
                    rows: vec![json!(["Valve", 2])],
                    ..TableRecord::default()
                },
            ],
            total_pages: None,
        };

        let report = extractor.extract("doc", &content).await;

        let kinds: Vec<ChunkKind> = report.chunks.iter().map(Chunk::kind).collect();
        assert_eq!(
            kinds,
            vec![ChunkKind::Paragraph, ChunkKind::Image, ChunkKind::Table]
        );
        assert_eq!(report.chunks[1].ocr_confidence(), Some(91.0));
        assert_eq!(report.chunks[1].page_number, 4);
        assert_eq!(report.dropped, 2);
        assert_eq!(report.skipped.len(), 3);
        for chunk in &report.chunks {
            let minimum = match chunk.kind() {
                ChunkKind::Image => MIN_OCR_CHARS,
                _ => MIN_TEXT_CHARS,
            };
            assert!(char_len(&chunk.content) >= minimum);
        }
    }

    #[tokio::test]
    async fn images_are_skipped_without_an_ocr_engine() {
        let extractor = ChunkExtractor::default();
        let content = ParsedContent {
            images: vec![ImageRecord {
                data: Some(b"Scanned warranty card".to_vec()),
                page_number: Some(1),
                position: None,
            }],
            ..ParsedContent::default()
        };

        let report = extractor.extract("doc", &content).await;
        assert!(report.chunks.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].kind, ChunkKind::Image);
    }
}
