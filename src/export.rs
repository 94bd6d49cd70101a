use anyhow::{anyhow, Context};
use serde_json::json;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::calc::ReportDocument;
use crate::db;

const MANIFEST_ENTRY: &str = "manifest.json";
pub const BUNDLE_FORMAT_V1: &str = "school-reports-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
}

/// Matches the file names the portal's client-side bundler has always
/// produced, so downstream tooling keeps working.
pub fn report_entry_name(doc: &ReportDocument) -> String {
    format!(
        "Report_{}_T{}S{}.json",
        doc.student.matricule, doc.term, doc.sequence
    )
}

/// Writes one class/period's report documents into a zip bundle: a manifest
/// entry followed by one JSON document per student.
pub fn export_report_bundle(
    out_path: &Path,
    class_name: &str,
    term: i64,
    sequence: i64,
    reports: &[ReportDocument],
) -> anyhow::Result<ExportSummary> {
    if reports.is_empty() {
        return Err(anyhow!("no report documents to export"));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "class": class_name,
        "term": term,
        "sequence": sequence,
        "exportedAt": db::now_iso(),
        "reportCount": reports.len(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    for doc in reports {
        let entry = report_entry_name(doc);
        zip.start_file(entry.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", entry))?;
        zip.write_all(
            serde_json::to_string_pretty(doc)
                .with_context(|| format!("failed to serialize entry {}", entry))?
                .as_bytes(),
        )
        .with_context(|| format!("failed to write entry {}", entry))?;
    }

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: reports.len() + 1,
    })
}
