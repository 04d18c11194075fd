//! Markdown export of a finished research report.

use std::path::Path;

use tracing::{debug, instrument};

use darkscout_shared::{DarkscoutError, Result};

use crate::pipeline::PipelineOutcome;

/// Render the final report under a header naming the query, time, and sources.
pub fn render_report(outcome: &PipelineOutcome) -> String {
    let run = &outcome.run;
    let mut out = String::new();

    out.push_str("# Research report\n\n");
    out.push_str(&format!("- **Query:** {}\n", run.query));
    out.push_str(&format!("- **Run:** {}\n", run.id));
    out.push_str(&format!("- **Generated:** {}\n", run.finished_at.to_rfc3339()));
    out.push_str(&format!("- **Sources:** {}\n", outcome.state.crawled_data.len()));
    for source in &outcome.state.crawled_data {
        if source.errors.is_empty() {
            out.push_str(&format!("  - {}\n", source.url));
        } else {
            out.push_str(&format!(
                "  - {} ({} errors)\n",
                source.url,
                source.errors.len()
            ));
        }
    }

    out.push_str("\n---\n\n");
    out.push_str(run.report.trim_end());
    out.push('\n');
    out
}

/// Write the rendered report to `path` atomically (temp file, then rename).
#[instrument(skip_all, fields(path = %path.display()))]
pub fn write_report(path: &Path, outcome: &PipelineOutcome) -> Result<()> {
    let content = render_report(outcome);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| DarkscoutError::io(parent, e))?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| DarkscoutError::validation(format!("not a file path: {}", path.display())))?;
    let temp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    std::fs::write(&temp, &content).map_err(|e| DarkscoutError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| DarkscoutError::io(path, e))?;

    debug!(size = content.len(), "wrote report");
    Ok(())
}
