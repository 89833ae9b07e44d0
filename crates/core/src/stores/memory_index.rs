use crate::error::BackendError;
use crate::models::{
    IndexDocument, IndexFilter, IndexHit, IndexQuery, IndexSearchResult, IndexSettings, SortField,
    SortOrder,
};
use crate::text::tokenize;
use crate::traits::SearchIndex;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct LocalIndex {
    settings: Option<IndexSettings>,
    documents: BTreeMap<String, IndexDocument>,
}

/// Search index kept in process memory, with the same contract as the HTTP-backed index:
/// every query term must prefix-match a token of the content, filters are exact, sorting is
/// limited to the sortable attributes and formatted content is highlighted and cropped.
#[derive(Default)]
pub struct MemorySearchIndex {
    indexes: RwLock<HashMap<String, LocalIndex>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn document_count(&self, uid: &str) -> Option<usize> {
        self.indexes
            .read()
            .await
            .get(uid)
            .map(|index| index.documents.len())
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn create_index(&self, uid: &str) -> Result<(), BackendError> {
        let mut indexes = self.indexes.write().await;
        if indexes.contains_key(uid) {
            return Err(BackendError::IndexAlreadyExists(uid.to_string()));
        }
        indexes.insert(uid.to_string(), LocalIndex::default());
        Ok(())
    }

    async fn configure(&self, uid: &str, settings: &IndexSettings) -> Result<(), BackendError> {
        let mut indexes = self.indexes.write().await;
        let index = indexes
            .get_mut(uid)
            .ok_or_else(|| BackendError::IndexNotFound(uid.to_string()))?;
        index.settings = Some(settings.clone());
        Ok(())
    }

    async fn add_documents(
        &self,
        uid: &str,
        documents: &[IndexDocument],
    ) -> Result<(), BackendError> {
        let mut indexes = self.indexes.write().await;
        let index = indexes
            .get_mut(uid)
            .ok_or_else(|| BackendError::IndexNotFound(uid.to_string()))?;
        for document in documents {
            index
                .documents
                .insert(document.id.clone(), document.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        uid: &str,
        query: &IndexQuery,
    ) -> Result<IndexSearchResult, BackendError> {
        let started = Instant::now();
        let indexes = self.indexes.read().await;
        let index = indexes
            .get(uid)
            .ok_or_else(|| BackendError::IndexNotFound(uid.to_string()))?;

        let stop_words: &[String] = index
            .settings
            .as_ref()
            .map(|settings| settings.stop_words.as_slice())
            .unwrap_or(&[]);
        let terms = query_terms(&query.text, stop_words);

        let mut matched: Vec<(usize, &IndexDocument)> = index
            .documents
            .values()
            .filter(|document| query.filters.iter().all(|filter| passes(filter, document)))
            .filter_map(|document| score(&terms, &document.content).map(|score| (score, document)))
            .collect();

        match query.sort {
            Some((field, order)) => matched.sort_by(|left, right| {
                compare_attribute(field, order, left.1, right.1)
                    .then_with(|| right.0.cmp(&left.0))
                    .then_with(|| left.1.id.cmp(&right.1.id))
            }),
            None => matched.sort_by(|left, right| {
                right
                    .0
                    .cmp(&left.0)
                    .then_with(|| left.1.page_number.cmp(&right.1.page_number))
                    .then_with(|| left.1.id.cmp(&right.1.id))
            }),
        }

        let estimated_total = matched.len();
        let hits = matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|(_, document)| IndexHit {
                formatted_content: format_content(&document.content, &terms, query),
                document: document.clone(),
            })
            .collect();

        Ok(IndexSearchResult {
            hits,
            estimated_total,
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn delete_index(&self, uid: &str) -> Result<(), BackendError> {
        match self.indexes.write().await.remove(uid) {
            Some(_) => Ok(()),
            None => Err(BackendError::IndexNotFound(uid.to_string())),
        }
    }
}

fn query_terms(text: &str, stop_words: &[String]) -> Vec<String> {
    let tokens = tokenize(text);
    let meaningful: Vec<String> = tokens
        .iter()
        .filter(|token| !stop_words.contains(token))
        .cloned()
        .collect();
    if meaningful.is_empty() {
        tokens
    } else {
        meaningful
    }
}

fn term_matches(term: &str, token: &str) -> bool {
    token.starts_with(term)
}

/// Number of matching tokens, or `None` when some term matches nothing.
/// An empty term list matches every document.
fn score(terms: &[String], content: &str) -> Option<usize> {
    let tokens = tokenize(content);
    let mut total = 0;
    for term in terms {
        let occurrences = tokens
            .iter()
            .filter(|token| term_matches(term, token))
            .count();
        if occurrences == 0 {
            return None;
        }
        total += occurrences;
    }
    Some(total)
}

fn passes(filter: &IndexFilter, document: &IndexDocument) -> bool {
    match filter {
        IndexFilter::Kind(kind) => document.kind == *kind,
        IndexFilter::Page(page) => document.page_number == *page,
        IndexFilter::MinConfidence(threshold) => document
            .ocr_confidence
            .is_some_and(|confidence| confidence >= *threshold),
    }
}

fn compare_attribute(
    field: SortField,
    order: SortOrder,
    left: &IndexDocument,
    right: &IndexDocument,
) -> Ordering {
    let value = |document: &IndexDocument| -> Option<f64> {
        match field {
            SortField::PageNumber => Some(f64::from(document.page_number)),
            SortField::WordCount => Some(document.word_count as f64),
            SortField::CharCount => Some(document.char_count as f64),
            SortField::OcrConfidence => document.ocr_confidence.map(f64::from),
        }
    };

    // Documents without the attribute go last in either direction.
    match (value(left), value(right)) {
        (Some(a), Some(b)) => match order {
            SortOrder::Asc => a.total_cmp(&b),
            SortOrder::Desc => b.total_cmp(&a),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn format_content(content: &str, terms: &[String], query: &IndexQuery) -> Option<String> {
    if query.highlight.is_none() && query.crop_length.is_none() {
        return None;
    }

    let words: Vec<&str> = content.split_whitespace().collect();
    let is_match = |word: &str| {
        !terms.is_empty()
            && tokenize(word)
                .iter()
                .any(|token| terms.iter().any(|term| term_matches(term, token)))
    };

    let (start, end) = match query.crop_length {
        Some(length) if length > 0 && words.len() > length => {
            let first_match = words.iter().position(|word| is_match(word)).unwrap_or(0);
            let start = first_match
                .saturating_sub(length / 2)
                .min(words.len() - length);
            (start, start + length)
        }
        _ => (0, words.len()),
    };

    let mut rendered: Vec<String> = words[start..end]
        .iter()
        .map(|word| match &query.highlight {
            Some(highlight) if is_match(word) => {
                format!("{}{}{}", highlight.pre_tag, word, highlight.post_tag)
            }
            _ => word.to_string(),
        })
        .collect();

    if start > 0 {
        rendered.insert(0, "…".to_string());
    }
    if end < words.len() {
        rendered.push("…".to_string());
    }
    Some(rendered.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkKind, Highlight};

    fn document(id: &str, kind: ChunkKind, page: u32, content: &str) -> IndexDocument {
        IndexDocument {
            id: id.to_string(),
            document_id: "doc".to_string(),
            kind,
            content: content.to_string(),
            page_number: page,
            ocr_confidence: (kind == ChunkKind::Image).then_some(70.0 + page as f32),
            word_count: content.split_whitespace().count(),
            char_count: content.chars().count(),
            position: None,
        }
    }

    async fn seeded() -> MemorySearchIndex {
        let index = MemorySearchIndex::new();
        index.create_index("doc_1").await.unwrap();
        index
            .configure("doc_1", &IndexSettings::for_chunks())
            .await
            .unwrap();
        index
            .add_documents(
                "doc_1",
                &[
                    document("p1", ChunkKind::Paragraph, 1, "The quick brown fox jumps over the lazy dog"),
                    document("p2", ChunkKind::Paragraph, 3, "Foxes are quick and foxes are clever"),
                    document("i1", ChunkKind::Image, 2, "Scanned fox sticker"),
                    document("i2", ChunkKind::Image, 5, "Scanned warranty card"),
                    document("t1", ChunkKind::Table, 2, "Headers: A, B\nRow 1: 1, 2"),
                ],
            )
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn duplicate_create_and_missing_delete_are_reported() {
        let index = seeded().await;
        assert!(matches!(
            index.create_index("doc_1").await,
            Err(BackendError::IndexAlreadyExists(_))
        ));
        assert!(matches!(
            index.delete_index("doc_2").await,
            Err(BackendError::IndexNotFound(_))
        ));
        assert!(matches!(
            index.search("doc_2", &IndexQuery::new("fox", 10)).await,
            Err(BackendError::IndexNotFound(_))
        ));
    }

    #[tokio::test]
    async fn terms_prefix_match_and_rank_by_occurrences() {
        let index = seeded().await;
        let result = index.search("doc_1", &IndexQuery::new("fox", 10)).await.unwrap();
        let ids: Vec<&str> = result.hits.iter().map(|hit| hit.document.id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p1", "i1"]);
        assert_eq!(result.estimated_total, 3);
    }

    #[tokio::test]
    async fn stop_words_are_ignored_in_queries() {
        let index = seeded().await;
        let result = index
            .search("doc_1", &IndexQuery::new("the lazy", 10))
            .await
            .unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].document.id, "p1");
    }

    #[tokio::test]
    async fn filters_and_sorting_apply() {
        let index = seeded().await;
        let mut query = IndexQuery::new("scanned", 10);
        query.filters = vec![IndexFilter::Kind(ChunkKind::Image), IndexFilter::MinConfidence(73.0)];
        let result = index.search("doc_1", &query).await.unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].document.id, "i2");

        let mut sorted = IndexQuery::new("fox", 10);
        sorted.sort = Some((SortField::PageNumber, SortOrder::Desc));
        let result = index.search("doc_1", &sorted).await.unwrap();
        let pages: Vec<u32> = result.hits.iter().map(|hit| hit.document.page_number).collect();
        assert_eq!(pages, vec![3, 2, 1]);

        let mut paged = IndexQuery::new("fox", 1);
        paged.offset = 1;
        paged.filters = vec![IndexFilter::Page(1)];
        let result = index.search("doc_1", &paged).await.unwrap();
        assert!(result.hits.is_empty());
        assert_eq!(result.estimated_total, 1);
    }

    #[tokio::test]
    async fn formatted_content_is_highlighted_and_cropped() {
        let index = seeded().await;
        let mut query = IndexQuery::new("lazy", 10);
        query.highlight = Some(Highlight {
            pre_tag: "<mark>".to_string(),
            post_tag: "</mark>".to_string(),
        });
        query.crop_length = Some(4);

        let result = index.search("doc_1", &query).await.unwrap();
        assert_eq!(
            result.hits[0].formatted_content.as_deref(),
            Some("… over the <mark>lazy</mark> dog")
        );
    }
}
