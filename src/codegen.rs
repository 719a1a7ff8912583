//! Blank-import file generation.
//!
//! The compiled assistant links plugins in through side-effect imports. The
//! generated file lists every manifest path once, sorted, so regenerating from
//! the same manifest always yields the same bytes.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::manifest::PluginManifest;

const GENERATED_HEADER: &str = "// This file is generated by `abot plugin install`. Do not edit.";

/// Render the import file for a manifest
pub fn render(manifest: &PluginManifest) -> String {
    let mut out = String::new();
    out.push_str(GENERATED_HEADER);
    out.push_str("\n\npackage main\n\nimport (\n");
    // PluginManifest iterates in lexicographic path order
    for path in manifest.paths() {
        let _ = writeln!(out, "\t_ \"{}\"", path);
    }
    out.push_str(")\n");
    out
}

/// Render and write the import file, replacing any previous contents
pub fn write(manifest: &PluginManifest, dest: &Path) -> std::io::Result<()> {
    let rendered = render(manifest);
    fs::write(dest, &rendered)?;
    debug!(path = ?dest, imports = manifest.len(), "Wrote plugin import file");
    Ok(())
}
