use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One piece of web evidence the model reported drawing on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<WebSource>,
}

impl EvidenceChunk {
    pub fn web(uri: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            web: Some(WebSource {
                uri: Some(uri.into()),
                title: Some(title.into()),
            }),
        }
    }

    pub fn usable_uri(&self) -> Option<&str> {
        self.web
            .as_ref()
            .and_then(|web| web.uri.as_deref())
            .filter(|uri| !uri.is_empty())
    }

    pub fn title(&self) -> Option<&str> {
        self.web
            .as_ref()
            .and_then(|web| web.title.as_deref())
            .filter(|title| !title.trim().is_empty())
    }

    /// Title for reference lists, falling back to the URI.
    pub fn display_title(&self) -> &str {
        self.title().or_else(|| self.usable_uri()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[serde(default)]
    pub start_index: Option<usize>,
    #[serde(default)]
    pub end_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A byte range of the model text backed by one or more evidence chunks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportSpan {
    #[serde(default)]
    pub segment: Segment,
    #[serde(default)]
    pub grounding_chunk_indices: Vec<usize>,
    #[serde(default)]
    pub confidence_scores: Vec<f32>,
}

impl SupportSpan {
    pub fn new(start: Option<usize>, end: usize, chunk_indices: Vec<usize>) -> Self {
        Self {
            segment: Segment {
                start_index: start,
                end_index: Some(end),
                text: None,
            },
            grounding_chunk_indices: chunk_indices,
            confidence_scores: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStyle {
    #[default]
    Superscript,
    Plain,
}

impl MarkerStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkerStyle::Superscript => "superscript",
            MarkerStyle::Plain => "plain",
        }
    }

    pub fn render(self, display_numbers: &[usize]) -> String {
        let joined = display_numbers
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        match self {
            MarkerStyle::Superscript => format!("<sup class=\"citation\">[{joined}]</sup>"),
            MarkerStyle::Plain => format!("[{joined}]"),
        }
    }
}

impl fmt::Display for MarkerStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarkerStyle {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "superscript" | "sup" | "html" => Ok(MarkerStyle::Superscript),
            "plain" | "text" => Ok(MarkerStyle::Plain),
            other => anyhow::bail!("unknown citation marker style: {other}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reconciled {
    pub text: String,
    pub sources: Vec<EvidenceChunk>,
}

// Built once from the start-ordered walk and only read while inserting markers.
struct SourceNumbering {
    sources: Vec<EvidenceChunk>,
    source_for_chunk: HashMap<usize, usize>,
}

impl SourceNumbering {
    fn build(chunks: &[EvidenceChunk], supports: &[SupportSpan]) -> Self {
        let mut by_start: Vec<&SupportSpan> = supports.iter().collect();
        by_start.sort_by_key(|support| support.segment.start_index.unwrap_or(0));

        let mut sources: Vec<EvidenceChunk> = Vec::new();
        let mut source_for_chunk: HashMap<usize, usize> = HashMap::new();
        let mut source_for_uri: HashMap<&str, usize> = HashMap::new();

        for support in by_start {
            for &chunk_idx in &support.grounding_chunk_indices {
                if source_for_chunk.contains_key(&chunk_idx) {
                    continue;
                }
                let Some(chunk) = chunks.get(chunk_idx) else {
                    continue;
                };
                let Some(uri) = chunk.usable_uri() else {
                    continue;
                };

                let source_idx = *source_for_uri.entry(uri).or_insert_with(|| {
                    sources.push(chunk.clone());
                    sources.len() - 1
                });
                source_for_chunk.insert(chunk_idx, source_idx);
            }
        }

        Self {
            sources,
            source_for_chunk,
        }
    }

    fn display_numbers(&self, support: &SupportSpan) -> Vec<usize> {
        let mut resolved: Vec<usize> = support
            .grounding_chunk_indices
            .iter()
            .filter_map(|idx| self.source_for_chunk.get(idx).copied())
            .collect();
        resolved.sort_unstable();
        resolved.dedup();
        resolved.into_iter().map(|idx| idx + 1).collect()
    }
}

pub fn reconcile(text: &str, chunks: &[EvidenceChunk], supports: &[SupportSpan]) -> Reconciled {
    reconcile_with_style(text, chunks, supports, MarkerStyle::default())
}

pub fn reconcile_with_style(
    text: &str,
    chunks: &[EvidenceChunk],
    supports: &[SupportSpan],
    style: MarkerStyle,
) -> Reconciled {
    if supports.is_empty() {
        return Reconciled {
            text: text.to_string(),
            sources: chunks
                .iter()
                .filter(|chunk| chunk.usable_uri().is_some())
                .cloned()
                .collect(),
        };
    }

    let numbering = SourceNumbering::build(chunks, supports);

    let mut by_end: Vec<&SupportSpan> = supports.iter().collect();
    by_end.sort_by_key(|support| std::cmp::Reverse(support.segment.end_index.unwrap_or(0)));

    let mut annotated = text.to_string();
    let mut inserted = 0usize;
    let mut uncited = 0usize;
    let mut out_of_range = 0usize;

    for support in by_end {
        let numbers = numbering.display_numbers(support);
        if numbers.is_empty() {
            uncited += 1;
            continue;
        }

        let Some(insert_at) = support.segment.end_index else {
            out_of_range += 1;
            continue;
        };
        // Offsets are byte offsets; anything past the end or inside a
        // multi-byte character is dropped.
        if insert_at > annotated.len() || !annotated.is_char_boundary(insert_at) {
            out_of_range += 1;
            continue;
        }

        annotated.insert_str(insert_at, &style.render(&numbers));
        inserted += 1;
    }

    tracing::debug!(
        sources = numbering.sources.len(),
        markers = inserted,
        uncited,
        out_of_range,
        "reconciled citations"
    );

    Reconciled {
        text: annotated,
        sources: numbering.sources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use regex::Regex;
    use std::collections::HashSet;

    fn chunk(uri: &str) -> EvidenceChunk {
        EvidenceChunk::web(uri, format!("Title of {uri}"))
    }

    fn plain(text: &str, chunks: &[EvidenceChunk], supports: &[SupportSpan]) -> Reconciled {
        reconcile_with_style(text, chunks, supports, MarkerStyle::Plain)
    }

    #[test]
    fn inserts_marker_at_sentence_end() {
        let text = "Fish can count.Bees can too.";
        let result = plain(text, &[chunk("a.com")], &[SupportSpan::new(Some(0), 15, vec![0])]);

        assert_eq!(result.text, "Fish can count.[1]Bees can too.");
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.sources[0].usable_uri(), Some("a.com"));
    }

    #[test]
    fn superscript_marker_wraps_numbers() {
        let result = reconcile(
            "Claim.",
            &[chunk("a.com")],
            &[SupportSpan::new(Some(0), 6, vec![0])],
        );
        assert_eq!(result.text, "Claim.<sup class=\"citation\">[1]</sup>");
    }

    #[test]
    fn same_uri_under_different_indices_shares_number() {
        let text = "First claim. Second claim.";
        let chunks = vec![chunk("dup.com"), chunk("dup.com")];
        let supports = vec![
            SupportSpan::new(Some(0), 12, vec![0]),
            SupportSpan::new(Some(13), 26, vec![1]),
        ];

        let result = plain(text, &chunks, &supports);
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.text, "First claim.[1] Second claim.[1]");
    }

    #[test]
    fn out_of_bounds_chunk_index_contributes_nothing() {
        let text = "One. Two.";
        let chunks = vec![chunk("a.com"), chunk("b.com"), chunk("c.com")];
        let supports = vec![
            SupportSpan::new(Some(0), 4, vec![5]),
            SupportSpan::new(Some(5), 9, vec![1]),
        ];

        let result = plain(text, &chunks, &supports);
        assert_eq!(result.text, "One. Two.[1]");
        assert_eq!(result.sources, vec![chunk("b.com")]);
    }

    #[test]
    fn empty_supports_passes_text_and_keeps_duplicates() {
        let chunks = vec![chunk("x"), EvidenceChunk::default(), chunk("x")];
        let result = plain("untouched", &chunks, &[]);

        assert_eq!(result.text, "untouched");
        assert_eq!(result.sources, vec![chunk("x"), chunk("x")]);
    }

    #[test]
    fn later_offsets_are_spliced_first() {
        let text = "abcdefghijklmno";
        let chunks = vec![chunk("a.com"), chunk("b.com")];
        let supports = vec![
            SupportSpan::new(Some(0), 5, vec![0]),
            SupportSpan::new(Some(6), 10, vec![1]),
        ];

        let result = plain(text, &chunks, &supports);
        assert_eq!(result.text, "abcde[1]fghij[2]klmno");
    }

    #[test]
    fn numbering_follows_start_index_not_chunk_order() {
        let text = "Early claim. Late claim.";
        let chunks = vec![chunk("late.com"), chunk("early.com")];
        let supports = vec![
            SupportSpan::new(Some(13), 24, vec![0]),
            SupportSpan::new(None, 12, vec![1]),
        ];

        let result = plain(text, &chunks, &supports);
        assert_eq!(result.sources[0].usable_uri(), Some("early.com"));
        assert_eq!(result.sources[1].usable_uri(), Some("late.com"));
        assert_eq!(result.text, "Early claim.[1] Late claim.[2]");
    }

    #[test]
    fn marker_numbers_are_deduplicated_and_sorted() {
        let chunks = vec![chunk("a.com"), chunk("b.com"), chunk("a.com")];
        let supports = vec![
            SupportSpan::new(Some(0), 2, vec![0, 1]),
            SupportSpan::new(Some(3), 8, vec![1, 2, 0]),
        ];

        let result = plain("Hi. There", &chunks, &supports);
        assert_eq!(result.text, "Hi[1, 2]. Ther[1, 2]e");
    }

    #[test]
    fn chunk_without_uri_is_never_cited() {
        let chunks = vec![
            EvidenceChunk::default(),
            EvidenceChunk {
                web: Some(WebSource {
                    uri: Some(String::new()),
                    title: Some("Empty".to_string()),
                }),
            },
            chunk("ok.com"),
        ];
        let supports = vec![
            SupportSpan::new(Some(0), 3, vec![0, 1]),
            SupportSpan::new(Some(4), 7, vec![1, 2]),
        ];

        let result = plain("abc def", &chunks, &supports);
        assert_eq!(result.text, "abc def[1]");
        assert_eq!(result.sources, vec![chunk("ok.com")]);
    }

    #[test]
    fn offset_past_end_is_skipped() {
        let result = plain(
            "short",
            &[chunk("a.com")],
            &[SupportSpan::new(Some(0), 99, vec![0])],
        );
        assert_eq!(result.text, "short");
        assert_eq!(result.sources.len(), 1);
    }

    #[test]
    fn offset_inside_multibyte_char_is_skipped() {
        let text = "caf\u{e9} au lait";
        let result = plain(text, &[chunk("a.com")], &[SupportSpan::new(Some(0), 4, vec![0])]);
        assert_eq!(result.text, text);

        let result = plain(text, &[chunk("a.com")], &[SupportSpan::new(Some(0), 5, vec![0])]);
        assert_eq!(result.text, "caf\u{e9}[1] au lait");
    }

    #[test]
    fn missing_end_index_produces_no_marker() {
        let support = SupportSpan {
            segment: Segment {
                start_index: Some(0),
                end_index: None,
                text: None,
            },
            grounding_chunk_indices: vec![0],
            confidence_scores: vec![0.9],
        };
        let result = plain("text", &[chunk("a.com")], &[support]);
        assert_eq!(result.text, "text");
        assert_eq!(result.sources.len(), 1);
    }

    #[test]
    fn decodes_grounding_metadata_shape() {
        let raw = r#"{
            "groundingChunks": [{"web": {"uri": "https://a.org", "title": "a.org"}}, {}],
            "groundingSupports": [{
                "segment": {"endIndex": 4, "text": "Text"},
                "groundingChunkIndices": [0, 1],
                "confidenceScores": [0.8, 0.4]
            }]
        }"#;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Metadata {
            grounding_chunks: Vec<EvidenceChunk>,
            grounding_supports: Vec<SupportSpan>,
        }

        let metadata: Metadata = serde_json::from_str(raw).expect("metadata");
        assert_eq!(metadata.grounding_supports[0].segment.start_index, None);

        let result = plain("Text", &metadata.grounding_chunks, &metadata.grounding_supports);
        assert_eq!(result.text, "Text[1]");
        assert_eq!(result.sources[0].display_title(), "a.org");
    }

    #[test]
    fn marker_style_parses_aliases() {
        assert_eq!("plain".parse::<MarkerStyle>().ok(), Some(MarkerStyle::Plain));
        assert_eq!(" SUP ".parse::<MarkerStyle>().ok(), Some(MarkerStyle::Superscript));
        assert!("footnote".parse::<MarkerStyle>().is_err());
    }

    fn arb_chunk() -> impl Strategy<Value = EvidenceChunk> {
        prop_oneof![
            Just(EvidenceChunk::default()),
            Just(EvidenceChunk {
                web: Some(WebSource {
                    uri: Some(String::new()),
                    title: None
                })
            }),
            prop::sample::select(vec!["a.com", "b.com", "c.com", "d.com"]).prop_map(chunk),
        ]
    }

    fn arb_support() -> impl Strategy<Value = SupportSpan> {
        (
            prop::option::of(0usize..60),
            prop::option::of(0usize..60),
            prop::collection::vec(0usize..8, 0..4),
        )
            .prop_map(|(start, end, indices)| SupportSpan {
                segment: Segment {
                    start_index: start,
                    end_index: end,
                    text: None,
                },
                grounding_chunk_indices: indices,
                confidence_scores: vec![],
            })
    }

    fn strip_markers(text: &str) -> String {
        let re = Regex::new(r"\[\d+(, \d+)*\]").expect("marker regex");
        re.replace_all(text, "").into_owned()
    }

    proptest! {
        #[test]
        fn sources_have_unique_nonempty_uris(
            text in "[a-z .]{0,50}",
            chunks in prop::collection::vec(arb_chunk(), 0..6),
            supports in prop::collection::vec(arb_support(), 1..6),
        ) {
            let result = plain(&text, &chunks, &supports);
            let mut seen = HashSet::new();
            for source in &result.sources {
                let uri = source.usable_uri();
                prop_assert!(uri.is_some());
                prop_assert!(seen.insert(uri.map(str::to_string)));
            }
        }

        #[test]
        fn markers_only_add_text(
            text in "[a-z .]{0,50}",
            chunks in prop::collection::vec(arb_chunk(), 0..6),
            supports in prop::collection::vec(arb_support(), 0..6),
        ) {
            let result = plain(&text, &chunks, &supports);
            prop_assert_eq!(strip_markers(&result.text), text);
        }

        #[test]
        fn cited_numbers_stay_within_sources(
            text in "[a-z .]{0,50}",
            chunks in prop::collection::vec(arb_chunk(), 0..6),
            supports in prop::collection::vec(arb_support(), 1..6),
        ) {
            let result = plain(&text, &chunks, &supports);
            let re = Regex::new(r"\d+").expect("number regex");
            for found in re.find_iter(&result.text) {
                let n: usize = found.as_str().parse().expect("digits");
                prop_assert!(n >= 1 && n <= result.sources.len());
            }
        }

        #[test]
        fn empty_supports_is_a_passthrough(
            text in ".{0,40}",
            chunks in prop::collection::vec(arb_chunk(), 0..6),
        ) {
            let result = plain(&text, &chunks, &[]);
            let expected: Vec<EvidenceChunk> = chunks
                .iter()
                .filter(|chunk| chunk.usable_uri().is_some())
                .cloned()
                .collect();
            prop_assert_eq!(result.text, text);
            prop_assert_eq!(result.sources, expected);
        }

        #[test]
        fn offsets_past_the_text_never_insert(
            text in "[a-z .]{0,20}",
            chunks in prop::collection::vec(arb_chunk(), 1..6),
            indices in prop::collection::vec(0usize..6, 1..4),
            overshoot in 1usize..40,
        ) {
            let support = SupportSpan::new(Some(0), text.len() + overshoot, indices);
            let result = plain(&text, &chunks, &[support]);
            prop_assert_eq!(result.text, text);
        }
    }
}
