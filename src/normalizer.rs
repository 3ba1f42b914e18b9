//! Page text extraction and model-sized chunking.

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use scraper::{Html, Selector};
use std::borrow::Cow;
use url::Url;

/// Raw page bytes returned by a fetcher, awaiting normalization.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: Url,
    /// Response headers.
    pub headers: HeaderMap,
    /// Raw response body bytes.
    pub body: Vec<u8>,
}

impl FetchedPage {
    /// Builds a new fetched page payload.
    pub fn new(url: Url, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self { url, headers, body }
    }

    /// Convenience constructor for an HTML body, mostly useful for stub fetchers.
    pub fn html(url: Url, body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("text/html; charset=utf-8"),
        );
        Self::new(url, headers, body.into().into_bytes())
    }

    fn is_plain_text(&self) -> bool {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_ascii_lowercase().starts_with("text/plain"))
            .unwrap_or(false)
    }
}

/// Classification for extracted blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Heading text.
    Heading,
    /// Standard paragraph, also used for plain-text fallbacks.
    Paragraph,
    /// Bullet or numbered list item.
    ListItem,
    /// Preformatted snippet.
    Preformatted,
    /// Block quote.
    Quote,
}

/// Cleaned text block found in the page.
#[derive(Debug, Clone)]
pub struct TextBlock {
    /// Block classification.
    pub kind: BlockKind,
    /// Collapsed textual content.
    pub text: String,
    /// Whitespace token count.
    pub token_estimate: usize,
}

/// Bounded-length span of page text submitted to the topic models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChunk {
    /// Position of the chunk within the page.
    pub chunk_id: usize,
    /// Chunk text, blocks joined with blank lines.
    pub text: String,
    /// Whitespace token count, never above the configured target.
    pub token_estimate: usize,
}

/// Chunking knobs.
#[derive(Debug, Clone, Copy)]
pub struct NormalizationConfig {
    /// Maximum whitespace tokens per chunk.
    pub chunk_target_tokens: usize,
    /// Cap on the number of recorded blocks to avoid runaway memory use.
    pub max_blocks: usize,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            chunk_target_tokens: 256,
            max_blocks: 8192,
        }
    }
}

/// Errors surfaced while normalizing a page.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizationError {
    /// The response body was empty.
    #[error("no body bytes available for normalization")]
    EmptyBody,
    /// The body held no extractable text.
    #[error("page contains no extractable text")]
    NoText,
}

/// Stateless text extraction and chunking service.
#[derive(Clone)]
pub struct Normalizer {
    config: NormalizationConfig,
    selectors: RootSelectors,
}

impl Normalizer {
    /// Builds a new normalizer instance.
    pub fn new(config: NormalizationConfig) -> Self {
        Self {
            config,
            selectors: RootSelectors::new(),
        }
    }

    /// Extracts text blocks from a page and packs them into model-sized chunks.
    pub fn chunk_page(&self, page: &FetchedPage) -> Result<Vec<DocumentChunk>, NormalizationError> {
        if page.body.is_empty() {
            return Err(NormalizationError::EmptyBody);
        }

        let decoded = decode_body(&page.body);
        let blocks = if page.is_plain_text() {
            plain_text_blocks(&decoded)
        } else {
            self.html_blocks(&decoded)
        };
        let blocks: Vec<TextBlock> = blocks.into_iter().take(self.config.max_blocks).collect();

        let chunks = chunk_blocks(&blocks, self.config.chunk_target_tokens);
        if chunks.is_empty() {
            return Err(NormalizationError::NoText);
        }
        Ok(chunks)
    }

    fn html_blocks(&self, html: &str) -> Vec<TextBlock> {
        let document = Html::parse_document(html);
        let root = self.selectors.pick_root(&document);

        let mut collector = BlockCollector::new(self.config.max_blocks);
        collector.walk(root);
        if collector.blocks.is_empty() {
            // Pages built from bare divs still carry text worth classifying.
            let text = collapse_whitespace(&visible_text(root));
            return text_block(BlockKind::Paragraph, text).into_iter().collect();
        }
        collector.blocks
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(NormalizationConfig::default())
    }
}

#[derive(Clone)]
struct RootSelectors {
    article: Selector,
    main: Selector,
    body: Selector,
}

impl RootSelectors {
    fn new() -> Self {
        Self {
            article: Selector::parse("article").expect("article selector"),
            main: Selector::parse("main").expect("main selector"),
            body: Selector::parse("body").expect("body selector"),
        }
    }

    fn pick_root<'a>(&self, document: &'a Html) -> scraper::ElementRef<'a> {
        document
            .select(&self.article)
            .next()
            .or_else(|| document.select(&self.main).next())
            .or_else(|| document.select(&self.body).next())
            .unwrap_or_else(|| document.root_element())
    }
}

fn decode_body(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

struct BlockCollector {
    max_blocks: usize,
    blocks: Vec<TextBlock>,
}

impl BlockCollector {
    fn new(max_blocks: usize) -> Self {
        Self {
            max_blocks,
            blocks: Vec::new(),
        }
    }

    fn walk(&mut self, root: scraper::ElementRef<'_>) {
        for element in root.descendent_elements() {
            if self.blocks.len() >= self.max_blocks {
                break;
            }
            if has_skipped_ancestor(&element) || nested_in_block(&element) {
                continue;
            }
            self.maybe_record(element);
        }
    }

    fn maybe_record(&mut self, element: scraper::ElementRef<'_>) {
        let kind = match element.value().name() {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => BlockKind::Heading,
            "p" => BlockKind::Paragraph,
            "li" => BlockKind::ListItem,
            "blockquote" => BlockKind::Quote,
            "pre" => BlockKind::Preformatted,
            _ => return,
        };

        let raw: String = element.text().collect();
        let text = if kind == BlockKind::Preformatted {
            collapse_newlines(&raw)
        } else {
            collapse_whitespace(&raw)
        };
        if let Some(block) = text_block(kind, text) {
            self.blocks.push(block);
        }
    }
}

fn has_skipped_ancestor(element: &scraper::ElementRef<'_>) -> bool {
    std::iter::once(**element)
        .chain(element.ancestors())
        .filter_map(|node| node.value().as_element().map(|el| el.name()))
        .any(|tag| {
            matches!(
                tag,
                "script" | "style" | "template" | "noscript" | "svg" | "nav"
            )
        })
}

fn nested_in_block(element: &scraper::ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(|node| node.value().as_element().map(|el| el.name()))
        .any(|tag| {
            matches!(
                tag,
                "p" | "li" | "blockquote" | "pre" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
            )
        })
}

fn visible_text(root: scraper::ElementRef<'_>) -> String {
    let mut raw = String::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .filter_map(|parent| parent.value().as_element().map(|el| el.name()))
            .any(|tag| matches!(tag, "script" | "style" | "template" | "noscript" | "svg"));
        if !hidden {
            raw.push_str(text);
            raw.push(' ');
        }
    }
    raw
}

fn plain_text_blocks(text: &str) -> Vec<TextBlock> {
    text.split("\n\n")
        .filter_map(|para| text_block(BlockKind::Paragraph, collapse_whitespace(para)))
        .collect()
}

fn text_block(kind: BlockKind, text: String) -> Option<TextBlock> {
    if text.is_empty() {
        return None;
    }
    let token_estimate = estimate_tokens(&text);
    Some(TextBlock {
        kind,
        text,
        token_estimate,
    })
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collapse_newlines(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Packs blocks greedily into chunks of at most `target` tokens, splitting oversized blocks
/// on word boundaries.
fn chunk_blocks(blocks: &[TextBlock], target: usize) -> Vec<DocumentChunk> {
    let target = target.max(1);
    let mut chunks = Vec::new();
    let mut buffer: Vec<String> = Vec::new();
    let mut token_total = 0usize;

    for block in blocks {
        for piece in split_block(block, target) {
            let tokens = estimate_tokens(&piece);
            if token_total + tokens > target {
                flush_chunk(&mut chunks, &mut buffer, &mut token_total);
            }
            buffer.push(piece);
            token_total += tokens;
        }
    }
    flush_chunk(&mut chunks, &mut buffer, &mut token_total);
    chunks
}

fn split_block(block: &TextBlock, target: usize) -> Vec<String> {
    if block.token_estimate <= target {
        return vec![block.text.clone()];
    }
    let words: Vec<&str> = block.text.split_whitespace().collect();
    words.chunks(target).map(|window| window.join(" ")).collect()
}

fn flush_chunk(chunks: &mut Vec<DocumentChunk>, buffer: &mut Vec<String>, token_total: &mut usize) {
    if buffer.is_empty() {
        return;
    }
    chunks.push(DocumentChunk {
        chunk_id: chunks.len(),
        text: buffer.join("\n\n"),
        token_estimate: *token_total,
    });
    buffer.clear();
    *token_total = 0;
}
