use colored::*;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use crate::drivers::klepto::KleptoExtractor;
use crate::drivers::psql::PsqlLoader;
use crate::drivers::Extractor;
use crate::error::{Error, Result};
use crate::manifest::{ManifestStatus, SourceDescriptor};
use crate::registry::ArtifactRegistry;
use crate::resolver::RestoreResolver;
use crate::storage::{open_backend, RetryPolicy};

/// Runtime knobs parsed once at the boundary and passed as plain data.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOpts {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl RuntimeOpts {
    pub fn new(timeout_secs: u64, retries: u32) -> Result<Self> {
        if timeout_secs == 0 {
            return Err(Error::Configuration("--timeout-secs must be positive".into()));
        }
        if retries == 0 {
            return Err(Error::Configuration("--retries must be positive".into()));
        }
        Ok(RuntimeOpts {
            timeout: Duration::from_secs(timeout_secs),
            retry: RetryPolicy { attempts: retries, base_delay: Duration::from_millis(500) },
        })
    }
}

pub fn do_stash(
    opts: &RuntimeOpts,
    source: &str,
    bucket: &str,
    tags: &[String],
    config: Option<PathBuf>,
) -> Result<()> {
    let descriptor = SourceDescriptor::from_uri(source)?;
    let extractor = KleptoExtractor::new(config)?;
    let store = open_backend(bucket, opts.timeout)?;
    let registry = ArtifactRegistry::new(store.as_ref(), opts.retry);

    let bar = create_progress_bar(&format!("Extracting dump from {}", descriptor));
    let mut stream = extractor.extract(source)?;

    bar.set_message("Stashing dump");
    let outcome = registry.stash(&descriptor, stream.as_mut(), tags)?;
    bar.finish_with_message("Dump stashed");

    println!(
        "{} {}",
        "✔".green().bold(),
        format!("Dump stashed: {}", outcome.manifest.dump_id).green()
    );
    if !outcome.applied_tags.is_empty() {
        println!("  tags: {}", outcome.applied_tags.join(", "));
    }
    for (tag, reason) in &outcome.failed_tags {
        eprintln!(
            "{} {}: {}",
            "!".yellow().bold(),
            "Warning".yellow(),
            format!("tag '{}' was not applied: {}", tag, reason)
        );
    }
    Ok(())
}

pub fn do_restore(opts: &RuntimeOpts, dump_ref: &str, target: &str, bucket: &str) -> Result<()> {
    let target_label = SourceDescriptor::from_uri(target)?.to_string();
    let store = open_backend(bucket, opts.timeout)?;
    let registry = ArtifactRegistry::new(store.as_ref(), opts.retry);
    let resolver = RestoreResolver::new(&registry, opts.retry);

    let id = resolver.resolve(dump_ref)?;
    let bar = create_progress_bar(&format!("Restoring {}", id));
    let report = resolver.restore(&id, target, &target_label, &PsqlLoader)?;
    bar.finish_with_message("Restore complete");

    println!(
        "{} {}",
        "✔".green().bold(),
        format!(
            "Dump restored: {} -> {} ({} bytes in {:.1}s)",
            report.dump_id,
            report.target,
            report.bytes_transferred,
            report.duration.as_secs_f64()
        )
        .green()
    );
    Ok(())
}

pub fn do_list(opts: &RuntimeOpts, bucket: &str) -> Result<()> {
    let store = open_backend(bucket, opts.timeout)?;
    let registry = ArtifactRegistry::new(store.as_ref(), opts.retry);

    let manifests = registry.list_manifests()?;
    if manifests.is_empty() {
        println!("{} {}", "i".yellow().bold(), "No dumps found".yellow());
        return Ok(());
    }

    let bindings = registry.tag_bindings()?;
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").add_attribute(Attribute::Bold),
            Cell::new("Created").add_attribute(Attribute::Bold),
            Cell::new("Source").add_attribute(Attribute::Bold),
            Cell::new("Size").add_attribute(Attribute::Bold),
            Cell::new("Status").add_attribute(Attribute::Bold),
            Cell::new("Tags").add_attribute(Attribute::Bold),
        ]);

    for m in &manifests {
        let tags: Vec<&str> = bindings
            .iter()
            .filter(|(_, id)| *id == m.dump_id)
            .map(|(tag, _)| tag.as_str())
            .collect();
        let status = match m.status {
            ManifestStatus::Complete => "complete",
            ManifestStatus::Pending => "pending",
        };
        table.add_row(vec![
            Cell::new(m.dump_id.as_str()),
            Cell::new(m.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(m.source.to_string()),
            Cell::new(format_size(m.size_bytes)),
            Cell::new(status),
            Cell::new(tags.join(", ")),
        ]);
    }

    println!("{}", table);
    Ok(())
}

pub fn do_version() {
    println!("{} {}", "squirrel".bold(), env!("CARGO_PKG_VERSION").cyan());
}

fn create_progress_bar(prefix: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "),
    );
    bar.set_message(prefix.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_opts_reject_zero_values() {
        assert!(matches!(RuntimeOpts::new(0, 3), Err(Error::Configuration(_))));
        assert!(matches!(RuntimeOpts::new(30, 0), Err(Error::Configuration(_))));
        let opts = RuntimeOpts::new(30, 2).unwrap();
        assert_eq!(opts.timeout, Duration::from_secs(30));
        assert_eq!(opts.retry.attempts, 2);
    }

    #[test]
    fn sizes_format_human_readably() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MiB");
    }
}
