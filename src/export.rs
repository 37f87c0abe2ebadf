use std::fmt::Write;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::citations::EvidenceChunk;
use crate::models::ResearchReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    Bibtex,
    Ris,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Markdown => "text/markdown; charset=utf-8",
            ExportFormat::Bibtex | ExportFormat::Ris => "text/plain; charset=utf-8",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "md" | "markdown" => Ok(ExportFormat::Markdown),
            "bib" | "bibtex" => Ok(ExportFormat::Bibtex),
            "ris" => Ok(ExportFormat::Ris),
            other => anyhow::bail!("unsupported export format: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportFile {
    pub filename: String,
    pub content_type: &'static str,
    pub body: String,
}

pub fn export_report(
    report: &ResearchReport,
    format: ExportFormat,
    now: DateTime<Utc>,
) -> ExportFile {
    let (filename, body) = match format {
        ExportFormat::Markdown => (
            format!("{}_report.md", topic_slug(&report.topic)),
            report.content.clone(),
        ),
        ExportFormat::Bibtex => ("citations.bib".to_string(), to_bibtex(&report.sources, now)),
        ExportFormat::Ris => ("citations.ris".to_string(), to_ris(&report.sources)),
    };

    ExportFile {
        filename,
        content_type: format.content_type(),
        body,
    }
}

pub fn topic_slug(topic: &str) -> String {
    let whitespace = Regex::new(r"\s+").unwrap_or_else(|_| Regex::new("^$").unwrap());
    whitespace.replace_all(topic, "_").to_lowercase()
}

// Display numbers are list positions, so entries without a web source
// still consume their number.
pub fn to_bibtex(sources: &[EvidenceChunk], now: DateTime<Utc>) -> String {
    let stamp = now.timestamp_millis();
    let accessed = now.format("%Y-%m-%d").to_string();
    let mut bib = String::new();

    for (idx, source) in sources.iter().enumerate() {
        let Some(web) = source.web.as_ref() else {
            continue;
        };
        let _ = writeln!(bib, "@misc{{ref_{}_{stamp},", idx + 1);
        let _ = writeln!(
            bib,
            "  title = {{{{{}}}}},",
            web.title.as_deref().unwrap_or_default()
        );
        let _ = writeln!(
            bib,
            "  howpublished = {{\\url{{{}}}}},",
            web.uri.as_deref().unwrap_or_default()
        );
        let _ = writeln!(bib, "  note = {{Accessed: {accessed}}}");
        bib.push_str("}\n\n");
    }

    bib
}

pub fn to_ris(sources: &[EvidenceChunk]) -> String {
    let mut ris = String::new();

    for (idx, source) in sources.iter().enumerate() {
        let Some(web) = source.web.as_ref() else {
            continue;
        };
        ris.push_str("TY  - ELEC\n");
        let _ = writeln!(ris, "TI  - {}", web.title.as_deref().unwrap_or_default());
        let _ = writeln!(ris, "UR  - {}", web.uri.as_deref().unwrap_or_default());
        let _ = writeln!(ris, "ID  - {}", idx + 1);
        ris.push_str("ER  - \n\n");
    }

    ris
}

pub fn reference_list(sources: &[EvidenceChunk]) -> String {
    sources
        .iter()
        .enumerate()
        .filter_map(|(idx, source)| {
            let uri = source.usable_uri()?;
            Some(format!("{}. {} <{uri}>", idx + 1, source.display_title()))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
