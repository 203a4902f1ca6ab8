use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    ClearResult, DownloadResult, FilesResult, ListResult, MirrorsResult, ProgressEvent,
    ProgressSink, ShowResult, StaleResult,
};
use crate::mirror::{ContainerWipe, SampleMirror};
use crate::reconcile::ImportReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Json,
    Text,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_show(result: &ShowResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_files(result: &FilesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_download(result: &DownloadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_import(result: &ImportReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_mirror(result: &SampleMirror) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_mirrors(result: &MirrorsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_stale(result: &StaleResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_wipe(result: &ContainerWipe) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Writes progress lines to stderr.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({} ms)", event.message, elapsed.as_millis()),
            None => eprintln!("{}", event.message),
        }
    }
}

/// One `Key name: value` line per property, keys sorted.
pub fn format_properties(properties: &BTreeMap<String, String>) -> String {
    if properties.is_empty() {
        return "No additional metadata".to_string();
    }
    properties
        .iter()
        .map(|(key, value)| format!("{}: {value}", humanize(key)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `SAMPLE_TYPE` becomes `Sample type`.
pub fn humanize(key: &str) -> String {
    let spaced = key.replace('_', " ").to_lowercase();
    let mut chars = spaced.trim().chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn print_show_text(result: &ShowResult) -> io::Result<()> {
    let header = result.entity.header();
    let mut stdout = io::stdout();
    writeln!(
        stdout,
        "{} {} ({})",
        result.entity.kind(),
        header.code(),
        header.perm_id()
    )?;
    writeln!(stdout, "Type: {}", result.entity.type_text())?;
    writeln!(stdout, "Registered: {}", header.registered_at().to_rfc3339())?;
    writeln!(stdout, "Modified: {}", header.modified_at().to_rfc3339())?;
    writeln!(stdout, "{}", format_properties(header.properties()))?;
    if let Some(related) = &result.related {
        if let Some(experiment) = &related.experiment {
            writeln!(stdout, "Experiment: {} ({})", experiment.code, experiment.perm_id)?;
        }
        if !related.samples.is_empty() {
            let codes: Vec<_> = related.samples.iter().map(|s| s.code.as_str()).collect();
            writeln!(stdout, "Samples: {}", codes.join(", "))?;
        }
        if !related.datasets.is_empty() {
            let codes: Vec<_> = related.datasets.iter().map(|d| d.code.as_str()).collect();
            writeln!(stdout, "Datasets: {}", codes.join(", "))?;
        }
    }
    Ok(())
}
