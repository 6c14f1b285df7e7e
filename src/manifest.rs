//! Durable pipeline state: the manifest.
//!
//! # Architecture overview
//!
//! The manifest lives at `.bristlenose/manifest.json` inside the output
//! directory and records, for every stage, what ran, with which provider,
//! over which inputs (by content hash), and how it ended. Per-session
//! stages (transcribe, speakers, topics, quotes) additionally record one
//! entry per session so a resume can re-attempt only the sessions that
//! failed.
//!
//! Only the orchestrator writes the manifest, and it writes atomically
//! (temp file + rename) so an interrupted run never leaves a half-written
//! file behind.
//!
//! # Skip decision
//!
//! A stage (or a session within one) is skipped when all of:
//! - recorded status is `complete`;
//! - the intermediate artefact file still exists;
//! - the recorded input hash matches the current inputs;
//! - the recorded provider fingerprint matches the requested one, or the
//!   invocation opted into reusing whatever provider ran before.
//!
//! A schema-version mismatch is a hard error with a clear message — no
//! silent upgrade, because mixed-version intermediate files are worse
//! than a clean re-run.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BristlenoseError;

pub const SCHEMA_VERSION: u32 = 2;

pub fn pipeline_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Stage name constants; also the keys under `stages` in the JSON.
pub mod stage {
    pub const GROUP: &str = "group";
    pub const EXTRACT: &str = "extract";
    pub const TRANSCRIBE: &str = "transcribe";
    pub const SPEAKERS: &str = "speakers";
    pub const MERGE: &str = "merge";
    pub const REDACT: &str = "redact";
    pub const TOPICS: &str = "topics";
    pub const QUOTES: &str = "quotes";
    pub const CLUSTERS: &str = "clusters";
    pub const THEMES: &str = "themes";

    /// Execution order. Identity resolution runs on the merged segment
    /// sequence so the label→code mapping covers exactly the labels that
    /// survive merging.
    pub const ALL: &[&str] = &[
        GROUP, EXTRACT, TRANSCRIBE, MERGE, SPEAKERS, REDACT, TOPICS, QUOTES, CLUSTERS, THEMES,
    ];

    /// Stages that keep per-session records.
    pub const PER_SESSION: &[&str] = &[TRANSCRIBE, SPEAKERS, TOPICS, QUOTES];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Partial,
    Complete,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Partial => write!(f, "partial"),
            StageStatus::Complete => write!(f, "complete"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    /// Provider fingerprint (`vendor/model`) for LLM stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Content hash of the inputs this stage consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sessions_completed: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sessions: BTreeMap<String, SessionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub pipeline_version: String,
    pub project: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
}

impl Manifest {
    pub fn new(project: &str) -> Manifest {
        Manifest {
            schema_version: SCHEMA_VERSION,
            pipeline_version: pipeline_version().to_string(),
            project: project.to_string(),
            updated_at: Utc::now(),
            total_cost_usd: None,
            stages: BTreeMap::new(),
        }
    }

    /// Load the manifest; `Ok(None)` when none exists yet.
    pub fn load(path: &Path) -> Result<Option<Manifest>, BristlenoseError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|e| BristlenoseError::Manifest(format!("corrupt manifest: {e}")))?;
        if manifest.schema_version != SCHEMA_VERSION {
            return Err(BristlenoseError::Manifest(format!(
                "manifest schema version {} does not match this pipeline (expected {}); \
                 move or delete {} to start fresh",
                manifest.schema_version,
                SCHEMA_VERSION,
                path.display()
            )));
        }
        Ok(Some(manifest))
    }

    /// Atomic save: temp file in the same directory, then rename.
    pub fn save(&mut self, path: &Path) -> Result<(), BristlenoseError> {
        self.updated_at = Utc::now();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.get(name)
    }

    pub fn stage_mut(&mut self, name: &str) -> &mut StageRecord {
        self.stages.entry(name.to_string()).or_default()
    }

    pub fn begin_stage(&mut self, name: &str, fingerprint: Option<&str>, input_hash: &str) {
        let record = self.stage_mut(name);
        record.started_at = Some(Utc::now());
        record.completed_at = None;
        record.fingerprint = fingerprint.map(String::from);
        record.input_hash = Some(input_hash.to_string());
    }

    /// Close out a stage, deriving its status from the session records
    /// (or `complete` outright for whole-output stages).
    pub fn finish_stage(&mut self, name: &str) {
        let record = self.stage_mut(name);
        record.completed_at = Some(Utc::now());
        let failed = record
            .sessions
            .values()
            .filter(|s| s.status == StageStatus::Failed)
            .count();
        record.sessions_completed = record
            .sessions
            .values()
            .filter(|s| s.status == StageStatus::Complete)
            .count() as u32;
        record.status = if record.sessions.is_empty() {
            StageStatus::Complete
        } else if failed == 0 {
            StageStatus::Complete
        } else if failed == record.sessions.len() {
            StageStatus::Failed
        } else {
            StageStatus::Partial
        };
    }

    pub fn record_session_ok(
        &mut self,
        stage: &str,
        session_id: &str,
        fingerprint: Option<&str>,
        input_hash: &str,
    ) {
        self.stage_mut(stage).sessions.insert(
            session_id.to_string(),
            SessionRecord {
                status: StageStatus::Complete,
                fingerprint: fingerprint.map(String::from),
                input_hash: Some(input_hash.to_string()),
                error: None,
            },
        );
    }

    pub fn record_session_failed(&mut self, stage: &str, session_id: &str, error: &str) {
        self.stage_mut(stage).sessions.insert(
            session_id.to_string(),
            SessionRecord {
                status: StageStatus::Failed,
                fingerprint: None,
                input_hash: None,
                error: Some(error.to_string()),
            },
        );
    }

    /// Whole-stage skip decision (cross-session stages).
    pub fn should_skip_stage(
        &self,
        name: &str,
        input_hash: &str,
        fingerprint: Option<&str>,
        artefact_exists: bool,
        reuse_provider: bool,
    ) -> bool {
        let Some(record) = self.stage(name) else {
            return false;
        };
        record.status == StageStatus::Complete
            && artefact_exists
            && record.input_hash.as_deref() == Some(input_hash)
            && (reuse_provider || record.fingerprint.as_deref() == fingerprint)
    }

    /// Per-session skip decision (per-session stages).
    pub fn should_skip_session(
        &self,
        stage_name: &str,
        session_id: &str,
        input_hash: &str,
        fingerprint: Option<&str>,
        artefact_exists: bool,
        reuse_provider: bool,
    ) -> bool {
        let Some(record) = self
            .stage(stage_name)
            .and_then(|s| s.sessions.get(session_id))
        else {
            return false;
        };
        record.status == StageStatus::Complete
            && artefact_exists
            && record.input_hash.as_deref() == Some(input_hash)
            && (reuse_provider || record.fingerprint.as_deref() == fingerprint)
    }

    /// Session ids recorded as failed for a stage, in id order.
    pub fn failed_sessions(&self, stage_name: &str) -> Vec<String> {
        self.stage(stage_name)
            .map(|s| {
                s.sessions
                    .iter()
                    .filter(|(_, r)| r.status == StageStatus::Failed)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Human-readable status summary, for the read-only `status` command.
///
/// `artefacts` pairs each stage with its intermediate file so the report
/// can flag "manifest says complete but the artefact is gone".
pub fn status_report(manifest: &Manifest, artefacts: &[(&str, std::path::PathBuf)]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Project: {} (pipeline {}, updated {})\n",
        manifest.project,
        manifest.pipeline_version,
        manifest.updated_at.format("%Y-%m-%d %H:%M")
    ));

    for &name in stage::ALL {
        let Some(record) = manifest.stage(name) else {
            out.push_str(&format!("  {name:<12} pending\n"));
            continue;
        };
        let mut line = format!("  {name:<12} {}", record.status);
        if !record.sessions.is_empty() {
            line.push_str(&format!(
                " ({}/{} sessions)",
                record.sessions_completed,
                record.sessions.len()
            ));
        }
        if let Some(fp) = &record.fingerprint {
            line.push_str(&format!(" [{fp}]"));
        }
        if record.status == StageStatus::Complete {
            if let Some((_, path)) = artefacts.iter().find(|(n, _)| *n == name) {
                if !path.exists() {
                    line.push_str(" — WARNING: artefact missing, will re-run");
                }
            }
        }
        out.push_str(&line);
        out.push('\n');
    }

    if let Some(cost) = manifest.total_cost_usd {
        out.push_str(&format!(
            "  est. cost so far: {}\n",
            crate::llm::usage::format_cost(cost)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        let mut manifest = Manifest::new("research-alpha");
        manifest.begin_stage(stage::QUOTES, Some("anthropic/claude-sonnet-4"), "hash1");
        manifest.record_session_ok(stage::QUOTES, "s1", Some("anthropic/claude-sonnet-4"), "h-s1");
        manifest.record_session_failed(stage::QUOTES, "s2", "provider timeout");
        manifest.finish_stage(stage::QUOTES);
        manifest.save(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded.project, "research-alpha");
        let record = loaded.stage(stage::QUOTES).unwrap();
        assert_eq!(record.status, StageStatus::Partial);
        assert_eq!(record.sessions_completed, 1);
        assert_eq!(record.sessions["s2"].error.as_deref(), Some("provider timeout"));
    }

    #[test]
    fn test_load_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manifest::load(&dir.path().join("nope.json")).unwrap().is_none());
    }

    #[test]
    fn test_schema_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut manifest = Manifest::new("old");
        manifest.schema_version = SCHEMA_VERSION + 1;
        std::fs::write(&path, serde_json::to_string(&manifest).unwrap()).unwrap();

        let err = Manifest::load(&path).unwrap_err();
        assert!(matches!(err, BristlenoseError::Manifest(_)));
        assert!(err.to_string().contains("schema version"));
    }

    #[test]
    fn test_corrupt_manifest_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Manifest::load(&path),
            Err(BristlenoseError::Manifest(_))
        ));
    }

    #[test]
    fn test_skip_requires_all_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let artefact = dir.path().join("themes.json");
        std::fs::write(&artefact, "[]").unwrap();

        let mut manifest = Manifest::new("p");
        manifest.begin_stage(stage::THEMES, Some("anthropic/opus"), "hash1");
        manifest.finish_stage(stage::THEMES);

        let skip = |hash: &str, fp: Option<&str>, exists: bool, reuse: bool| {
            manifest.should_skip_stage(stage::THEMES, hash, fp, exists, reuse)
        };

        assert!(skip("hash1", Some("anthropic/opus"), true, false));
        // Input changed
        assert!(!skip("hash2", Some("anthropic/opus"), true, false));
        // Provider changed
        assert!(!skip("hash1", Some("openai/gpt-4o"), true, false));
        // …but reuse opts back in
        assert!(skip("hash1", Some("openai/gpt-4o"), true, true));
        // Artefact gone
        assert!(!skip("hash1", Some("anthropic/opus"), false, false));
        // Unknown stage
        assert!(!manifest.should_skip_stage("nope", "hash1", None, true, false));
    }

    #[test]
    fn test_per_session_skip_and_resume_list() {
        let mut manifest = Manifest::new("p");
        manifest.begin_stage(stage::TOPICS, Some("fp"), "hash");
        manifest.record_session_ok(stage::TOPICS, "s1", Some("fp"), "h-s1");
        manifest.record_session_failed(stage::TOPICS, "s2", "boom");
        manifest.record_session_ok(stage::TOPICS, "s3", Some("fp"), "h-s3");
        manifest.finish_stage(stage::TOPICS);

        assert!(manifest.should_skip_session(stage::TOPICS, "s1", "h-s1", Some("fp"), true, false));
        assert!(!manifest.should_skip_session(stage::TOPICS, "s2", "h-s2", Some("fp"), true, false));
        assert!(!manifest.should_skip_session(stage::TOPICS, "s1", "other", Some("fp"), true, false));
        assert_eq!(manifest.failed_sessions(stage::TOPICS), vec!["s2"]);
        assert_eq!(manifest.stage(stage::TOPICS).unwrap().status, StageStatus::Partial);
    }

    #[test]
    fn test_all_sessions_failed_is_failed() {
        let mut manifest = Manifest::new("p");
        manifest.begin_stage(stage::TRANSCRIBE, None, "h");
        manifest.record_session_failed(stage::TRANSCRIBE, "s1", "no gpu");
        manifest.finish_stage(stage::TRANSCRIBE);
        assert_eq!(
            manifest.stage(stage::TRANSCRIBE).unwrap().status,
            StageStatus::Failed
        );
    }

    #[test]
    fn test_status_report_flags_missing_artefact() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::new("p");
        manifest.begin_stage(stage::THEMES, Some("fp"), "h");
        manifest.finish_stage(stage::THEMES);

        let missing = dir.path().join("gone.json");
        let report = status_report(&manifest, &[(stage::THEMES, missing)]);
        assert!(report.contains("artefact missing"));
        assert!(report.contains("themes"));
        assert!(report.contains("pending")); // untouched stages listed too
    }
}
