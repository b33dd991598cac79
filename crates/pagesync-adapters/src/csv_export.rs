use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagesync_core::Source;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{CsvRow, ExtractOutput, RawPayload, RawRecord, SourceExtractor, SourceUnavailableError};

/// Columns an export must carry to be usable at all.
pub const REQUIRED_COLUMNS: [&str; 2] = ["Post ID", "Publish time"];

const PAGE_ID_COLUMN: &str = "Page ID";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone)]
pub struct CsvExtractorConfig {
    /// A single export file, or a directory of exports.
    pub path: PathBuf,
    /// Rows whose `Page ID` differs from this are dropped.
    pub page_id: Option<String>,
}

/// Reads Meta Business Suite post exports.
#[derive(Debug, Clone)]
pub struct CsvExtractor {
    config: CsvExtractorConfig,
}

#[derive(Debug, Default)]
pub(crate) struct ParsedExport {
    pub rows: Vec<CsvRow>,
    pub filtered: usize,
}

impl CsvExtractor {
    pub fn new(config: CsvExtractorConfig) -> Self {
        Self { config }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn unavailable(&self, reason: impl Into<String>) -> SourceUnavailableError {
        SourceUnavailableError::new(Source::Csv, reason)
    }

    /// Export files to read, in name order. Merged roll-ups are skipped.
    async fn export_files(&self) -> Result<Vec<PathBuf>, SourceUnavailableError> {
        let path = &self.config.path;
        let meta = fs::metadata(path)
            .await
            .map_err(|err| self.unavailable(format!("{}: {err}", path.display())))?;
        if meta.is_file() {
            return Ok(vec![path.clone()]);
        }

        let mut entries = fs::read_dir(path)
            .await
            .map_err(|err| self.unavailable(format!("listing {}: {err}", path.display())))?;
        let mut files = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let candidate = entry.path();
                    let name = entry.file_name().to_string_lossy().to_string();
                    let is_csv = candidate
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
                    if !is_csv {
                        continue;
                    }
                    if name.to_ascii_uppercase().contains("MERGED") {
                        debug!(file = %name, "skipping merged export");
                        continue;
                    }
                    files.push(candidate);
                }
                Ok(None) => break,
                Err(err) => {
                    return Err(self.unavailable(format!("listing {}: {err}", path.display())))
                }
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(self.unavailable(format!("no export files in {}", path.display())));
        }
        Ok(files)
    }

    /// Parse one export. `label` names the file in row locations.
    pub fn parse_export(
        &self,
        label: &str,
        observed_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<(Vec<CsvRow>, usize), SourceUnavailableError> {
        parse_export(label, observed_at, bytes, self.config.page_id.as_deref())
            .map(|parsed| (parsed.rows, parsed.filtered))
    }
}

pub(crate) fn parse_export(
    label: &str,
    observed_at: DateTime<Utc>,
    bytes: &[u8],
    page_id: Option<&str>,
) -> Result<ParsedExport, SourceUnavailableError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .byte_headers()
        .map_err(|err| SourceUnavailableError::new(Source::Csv, format!("{label}: {err}")))?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().to_string())
        .collect();

    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|required| !headers.iter().any(|h| h.eq_ignore_ascii_case(required)))
        .collect();
    if !missing.is_empty() {
        return Err(SourceUnavailableError::new(
            Source::Csv,
            format!("{label}: missing required columns {}", missing.join(", ")),
        ));
    }

    let page_id = page_id.map(str::trim).filter(|p| !p.is_empty());
    let mut parsed = ParsedExport::default();
    // Byte records so legacy-encoded exports keep their rows.
    for record in reader.byte_records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(file = label, error = %err, "unreadable export row skipped");
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        if std::str::from_utf8(record.as_slice()).is_err() {
            warn!(file = label, line, "export row is not UTF-8; invalid bytes replaced");
        }
        let columns: BTreeMap<String, String> = headers
            .iter()
            .cloned()
            .zip(record.iter().map(|cell| String::from_utf8_lossy(cell).into_owned()))
            .collect();
        let row = CsvRow {
            file: label.to_string(),
            line,
            observed_at,
            columns,
        };

        if let (Some(expected), Some(actual)) = (page_id, row.get(&[PAGE_ID_COLUMN])) {
            if actual != expected {
                debug!(location = %row.location(), page = actual, "row for another page dropped");
                parsed.filtered += 1;
                continue;
            }
        }
        parsed.rows.push(row);
    }
    Ok(parsed)
}

async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let meta = fs::metadata(path).await.ok()?;
    meta.modified().ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl SourceExtractor for CsvExtractor {
    fn source(&self) -> Source {
        Source::Csv
    }

    async fn extract(&self) -> Result<ExtractOutput, SourceUnavailableError> {
        let files = self.export_files().await?;
        let single = files.len() == 1;
        let mut output = ExtractOutput::default();

        for file in files {
            let label = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| file.display().to_string());
            let bytes = match fs::read(&file).await {
                Ok(bytes) => bytes,
                Err(err) if single => {
                    return Err(self.unavailable(format!("reading {}: {err}", file.display())))
                }
                Err(err) => {
                    warn!(file = %label, error = %err, "export unreadable; skipped");
                    continue;
                }
            };
            // Newer downloads carry fresher shared metrics.
            let observed_at = modified_at(&file).await.unwrap_or_else(Utc::now);

            match parse_export(&label, observed_at, &bytes, self.config.page_id.as_deref()) {
                Ok(parsed) => {
                    info!(file = %label, rows = parsed.rows.len(), filtered = parsed.filtered, "export read");
                    output.filtered += parsed.filtered;
                    output
                        .records
                        .extend(parsed.rows.into_iter().map(RawRecord::Csv));
                    output.payloads.push(RawPayload {
                        source: Source::Csv,
                        label,
                        extension: "csv",
                        bytes,
                    });
                }
                Err(err) if single => return Err(err),
                Err(err) => warn!(error = %err, "export skipped"),
            }
        }

        if output.payloads.is_empty() {
            return Err(self.unavailable(format!(
                "no usable export under {}",
                self.config.path.display()
            )));
        }
        Ok(output)
    }
}
