//! Tabular and calendar renderings of a merged digest.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use icalendar::{Calendar, Component, Property, ValueType};
use parquet::arrow::ArrowWriter;
use pogo_adapters::SourceRegistry;
use pogo_core::{Disposition, EventRecord, EventTiming};
use pogo_storage::LibraryIndex;
use rust_xlsxwriter::{Format, Workbook};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::merge::MergedDigest;

pub const EVENTS_HEADERS: [&str; 10] = [
    "Month",
    "Start",
    "End",
    "Timezone Disposition",
    "Event Name",
    "Category",
    "Sources",
    "Source URL(s)",
    "Notes",
    "Summary",
];

pub const SOURCES_HEADERS: [&str; 6] = [
    "Source",
    "Display Name",
    "Slug",
    "URL",
    "First Seen",
    "Last Fetched",
];

const LOCAL_ANNOTATION: &str = "Local time: this window repeats in every time zone.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRow {
    pub month: String,
    pub start: String,
    pub end: String,
    pub disposition: String,
    pub event_name: String,
    pub category: String,
    pub sources: String,
    pub urls: String,
    pub notes: String,
    pub summary: String,
}

impl EventRow {
    fn cells(&self) -> [&str; 10] {
        [
            self.month.as_str(),
            self.start.as_str(),
            self.end.as_str(),
            self.disposition.as_str(),
            self.event_name.as_str(),
            self.category.as_str(),
            self.sources.as_str(),
            self.urls.as_str(),
            self.notes.as_str(),
            self.summary.as_str(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRow {
    pub source_id: String,
    pub display_name: String,
    pub slug: String,
    pub url: String,
    pub first_seen: String,
    pub last_fetched: String,
}

impl SourceRow {
    fn cells(&self) -> [&str; 6] {
        [
            self.source_id.as_str(),
            self.display_name.as_str(),
            self.slug.as_str(),
            self.url.as_str(),
            self.first_seen.as_str(),
            self.last_fetched.as_str(),
        ]
    }
}

/// A calendar boundary in the form its disposition calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarTime {
    Date(NaiveDate),
    Floating(NaiveDateTime),
    Utc(DateTime<Utc>),
}

impl CalendarTime {
    fn append_to(&self, event: &mut icalendar::Event, name: &str) {
        match self {
            CalendarTime::Date(d) => {
                let mut prop = Property::new(name, d.format("%Y%m%d").to_string());
                prop.append_parameter(ValueType::Date);
                event.append_property(prop);
            }
            CalendarTime::Floating(dt) => {
                event.add_property(name, dt.format("%Y%m%dT%H%M%S").to_string());
            }
            CalendarTime::Utc(dt) => {
                event.add_property(name, dt.format("%Y%m%dT%H%M%SZ").to_string());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub uid: String,
    pub summary: String,
    pub description: String,
    pub disposition: Disposition,
    pub start: CalendarTime,
    pub end: Option<CalendarTime>,
}

#[derive(Debug, Clone, Default)]
pub struct DigestTables {
    pub events: Vec<EventRow>,
    pub sources: Vec<SourceRow>,
    pub calendar: Vec<CalendarEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct DigestExporter {
    registry: SourceRegistry,
}

impl DigestExporter {
    pub fn new(registry: SourceRegistry) -> Self {
        Self { registry }
    }

    pub fn render(&self, digest: &MergedDigest, index: &LibraryIndex) -> DigestTables {
        let mut tables = DigestTables::default();
        for record in &digest.records {
            tables.events.push(self.event_row(record));
            tables.calendar.push(self.calendar_entry(record));
            for provenance in &record.provenance {
                let entry = index.lookup(&provenance.source_id, &provenance.slug);
                tables.sources.push(SourceRow {
                    source_id: provenance.source_id.clone(),
                    display_name: self.registry.display_name(&provenance.source_id).to_string(),
                    slug: provenance.slug.clone(),
                    url: provenance.url.clone(),
                    first_seen: entry
                        .map(|e| e.first_seen)
                        .unwrap_or(record.first_seen)
                        .to_rfc3339(),
                    last_fetched: entry
                        .map(|e| e.last_fetched.to_rfc3339())
                        .unwrap_or_default(),
                });
            }
        }
        tables
            .sources
            .sort_by(|a, b| (&a.source_id, &a.slug).cmp(&(&b.source_id, &b.slug)));
        tables
            .sources
            .dedup_by(|a, b| a.source_id == b.source_id && a.slug == b.slug);
        tables
    }

    /// Display names in registry order, then any unknown sources by id.
    fn citation(&self, record: &EventRecord) -> String {
        let mut ids = record.source_ids().into_iter().collect::<Vec<_>>();
        ids.sort_by_key(|id| {
            self.registry
                .sources
                .iter()
                .position(|s| s.source_id == *id)
                .unwrap_or(usize::MAX)
        });
        ids.iter()
            .map(|id| self.registry.display_name(id))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn event_row(&self, record: &EventRecord) -> EventRow {
        let (start, end) = display_bounds(&record.timing);
        EventRow {
            month: record.timing.start_date().format("%B %Y").to_string(),
            start,
            end,
            disposition: record.disposition().label().to_string(),
            event_name: record.title.clone(),
            category: record.category.label().to_string(),
            sources: self.citation(record),
            urls: record
                .provenance
                .iter()
                .map(|p| p.url.as_str())
                .collect::<Vec<_>>()
                .join("; "),
            notes: record.notes.join("; "),
            summary: record.summary.clone().unwrap_or_default(),
        }
    }

    fn calendar_entry(&self, record: &EventRecord) -> CalendarEntry {
        let (start, end) = calendar_bounds(&record.timing);
        let mut lines = Vec::new();
        if let Some(summary) = &record.summary {
            lines.push(summary.clone());
        }
        if record.disposition() == Disposition::LocalRepeatsGlobally {
            lines.push(LOCAL_ANNOTATION.to_string());
        }
        lines.push(format!("Sources: {}", self.citation(record)));
        lines.extend(record.provenance.iter().map(|p| p.url.clone()));
        lines.extend(record.notes.iter().map(|n| format!("Note: {n}")));

        CalendarEntry {
            uid: format!("{}@pogo-digest", record.stable_id()),
            summary: record.title.clone(),
            description: lines.join("\n"),
            disposition: record.disposition(),
            start,
            end,
        }
    }
}

fn display_bounds(timing: &EventTiming) -> (String, String) {
    match timing {
        EventTiming::LocalRepeatsGlobally {
            start,
            end,
            all_day: true,
        } => (
            start.format("%Y-%m-%d").to_string(),
            end.map(|e| e.format("%Y-%m-%d").to_string()).unwrap_or_default(),
        ),
        EventTiming::LocalRepeatsGlobally { start, end, .. } => (
            start.format("%Y-%m-%d %H:%M").to_string(),
            end.map(|e| e.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default(),
        ),
        EventTiming::FixedUtcWindow { start, end } => (
            start.format("%Y-%m-%d %H:%M UTC").to_string(),
            end.map(|e| e.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_default(),
        ),
    }
}

/// All-day ends are exclusive dates in iCalendar.
fn calendar_bounds(timing: &EventTiming) -> (CalendarTime, Option<CalendarTime>) {
    match timing {
        EventTiming::LocalRepeatsGlobally {
            start,
            end,
            all_day: true,
        } => {
            let last = end.map(|e| e.date()).unwrap_or(start.date());
            let exclusive = last.checked_add_days(Days::new(1)).unwrap_or(last);
            (
                CalendarTime::Date(start.date()),
                Some(CalendarTime::Date(exclusive)),
            )
        }
        EventTiming::LocalRepeatsGlobally { start, end, .. } => (
            CalendarTime::Floating(*start),
            end.map(CalendarTime::Floating),
        ),
        EventTiming::FixedUtcWindow { start, end } => {
            (CalendarTime::Utc(*start), end.map(CalendarTime::Utc))
        }
    }
}

/// Serializes calendar entries; `generated_at` stamps every DTSTAMP.
pub fn render_ics(entries: &[CalendarEntry], generated_at: DateTime<Utc>) -> String {
    let mut cal = Calendar::new();
    let stamp = generated_at.format("%Y%m%dT%H%M%SZ").to_string();

    for entry in entries {
        let mut event = icalendar::Event::new();
        event.uid(&entry.uid);
        event.summary(&entry.summary);
        event.add_property("DTSTAMP", &stamp);
        entry.start.append_to(&mut event, "DTSTART");
        if let Some(end) = &entry.end {
            end.append_to(&mut event, "DTEND");
        }
        event.description(&entry.description);
        event.add_property("X-POGO-DISPOSITION", entry.disposition.label());
        cal.push(event.done());
    }

    cal.done().to_string()
}

pub fn write_ics(path: &Path, entries: &[CalendarEntry], generated_at: DateTime<Utc>) -> Result<()> {
    ensure_parent(path)?;
    fs::write(path, render_ics(entries, generated_at))
        .with_context(|| format!("writing {}", path.display()))
}

pub fn write_xlsx(path: &Path, tables: &DigestTables) -> Result<()> {
    ensure_parent(path)?;
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();

    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Events").context("naming Events sheet")?;
        for (col, title) in EVENTS_HEADERS.iter().enumerate() {
            sheet
                .write_string_with_format(0, col as u16, *title, &header)
                .context("writing Events header")?;
        }
        for (i, row) in tables.events.iter().enumerate() {
            for (col, cell) in row.cells().iter().enumerate() {
                sheet
                    .write_string(i as u32 + 1, col as u16, *cell)
                    .context("writing Events row")?;
            }
        }
        sheet.set_freeze_panes(1, 0).context("freezing Events header")?;
    }

    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Sources").context("naming Sources sheet")?;
        for (col, title) in SOURCES_HEADERS.iter().enumerate() {
            sheet
                .write_string_with_format(0, col as u16, *title, &header)
                .context("writing Sources header")?;
        }
        for (i, row) in tables.sources.iter().enumerate() {
            for (col, cell) in row.cells().iter().enumerate() {
                sheet
                    .write_string(i as u32 + 1, col as u16, *cell)
                    .context("writing Sources row")?;
            }
        }
        sheet.set_freeze_panes(1, 0).context("freezing Sources header")?;
    }

    workbook
        .save(path)
        .with_context(|| format!("saving workbook {}", path.display()))
}

/// Writes `events.parquet`, `sources.parquet`, and a sha256 `manifest.json`.
pub fn write_parquet_snapshots(
    dir: &Path,
    tables: &DigestTables,
    generated_at: DateTime<Utc>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let events_path = dir.join("events.parquet");
    let sources_path = dir.join("sources.parquet");
    write_events_parquet(&events_path, &tables.events)?;
    write_sources_parquet(&sources_path, &tables.sources)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        generated_at,
        files: vec![
            manifest_entry("events", dir, &events_path)?,
            manifest_entry("sources", dir, &sources_path)?,
        ],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display())),
        _ => Ok(()),
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// One non-null Utf8 column per header, filled from each row's cells.
fn string_batch<const N: usize>(headers: [&str; N], rows: &[[&str; N]]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(
        headers
            .iter()
            .map(|h| ArrowField::new(column_name(h), DataType::Utf8, false))
            .collect::<Vec<_>>(),
    ));
    let columns = (0..N)
        .map(|col| {
            Arc::new(StringArray::from(
                rows.iter().map(|r| Some(r[col])).collect::<Vec<_>>(),
            )) as arrow_array::ArrayRef
        })
        .collect::<Vec<_>>();
    RecordBatch::try_new(schema, columns).context("building record batch")
}

fn column_name(header: &str) -> String {
    header
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn write_events_parquet(path: &Path, rows: &[EventRow]) -> Result<()> {
    let cells = rows.iter().map(EventRow::cells).collect::<Vec<_>>();
    let batch = string_batch(EVENTS_HEADERS, &cells).context("building events record batch")?;
    write_parquet(path, batch)
}

fn write_sources_parquet(path: &Path, rows: &[SourceRow]) -> Result<()> {
    let cells = rows.iter().map(SourceRow::cells).collect::<Vec<_>>();
    let batch = string_batch(SOURCES_HEADERS, &cells).context("building sources record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
