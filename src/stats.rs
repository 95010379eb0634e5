//! Storage and index statistics.
//!
//! Summarises deduplication savings, chunk counts, indexing states, and the
//! deletion outbox. Used by `vault stats` to show that uploads dedupe and
//! that indexing keeps up.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cas::StorageMetrics;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultStats {
    pub storage: StorageMetrics,
    pub chunks: u64,
    pub embedding_model: String,
    pub embedding_dims: usize,
    /// `index_status` rows per state name.
    pub index_states: BTreeMap<String, u64>,
    pub pending_cleanups: u64,
    /// Cleanups that exhausted their retries and need `vault repair`.
    pub alarmed_cleanups: u64,
}

impl VaultStats {
    /// Render the human-readable report printed by `vault stats`.
    pub fn render(&self) -> String {
        let s = &self.storage;
        let mut out = String::new();
        out.push_str("File Vault Stats\n");
        out.push_str("================\n\n");
        out.push_str(&format!("  Files:           {}\n", s.total_files));
        out.push_str(&format!("  Unique contents: {}\n", s.unique_contents));
        out.push_str(&format!("  Logical size:    {}\n", format_bytes(s.logical_bytes)));
        out.push_str(&format!("  Physical size:   {}\n", format_bytes(s.physical_bytes)));
        out.push_str(&format!(
            "  Saved by dedup:  {} (ratio {:.2})\n",
            format_bytes(s.bytes_saved),
            s.dedup_ratio
        ));
        if s.orphaned_contents > 0 {
            out.push_str(&format!("  Orphaned:        {}\n", s.orphaned_contents));
        }
        out.push('\n');
        out.push_str(&format!(
            "  Embedding:       {} ({} dims)\n",
            self.embedding_model, self.embedding_dims
        ));
        out.push_str(&format!("  Chunks:          {}\n", self.chunks));

        if !self.index_states.is_empty() {
            out.push_str("\n  Indexing:\n");
            out.push_str(&format!("  {:<12} {:>8}\n", "STATE", "FILES"));
            out.push_str(&format!("  {}\n", "-".repeat(21)));
            for (state, n) in &self.index_states {
                out.push_str(&format!("  {:<12} {:>8}\n", state, n));
            }
        }

        if self.pending_cleanups > 0 || self.alarmed_cleanups > 0 {
            out.push_str(&format!(
                "\n  Cleanups:        {} pending, {} alarmed\n",
                self.pending_cleanups, self.alarmed_cleanups
            ));
        }
        out
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MB");
    }

    #[test]
    fn test_render_mentions_alarms_only_when_present() {
        let mut stats = VaultStats {
            storage: StorageMetrics {
                total_files: 3,
                unique_contents: 2,
                logical_bytes: 300,
                physical_bytes: 200,
                bytes_saved: 100,
                dedup_ratio: 2.0 / 3.0,
                orphaned_contents: 0,
            },
            chunks: 7,
            embedding_model: "feature-hash-384".into(),
            embedding_dims: 384,
            index_states: BTreeMap::from([("done".to_string(), 3)]),
            pending_cleanups: 0,
            alarmed_cleanups: 0,
        };
        let text = stats.render();
        assert!(text.contains("Files:           3"));
        assert!(text.contains("done"));
        assert!(!text.contains("Cleanups"));

        stats.alarmed_cleanups = 1;
        assert!(stats.render().contains("0 pending, 1 alarmed"));
    }
}
