//! Persistent people registry (`people.yaml`).
//!
//! # Architecture overview
//!
//! Every speaker code the project has ever assigned lives in this file,
//! which is both machine-written and human-edited. Each entry has two
//! blocks with opposite update rules:
//!
//! - `computed` — session id, role, words spoken, speaking seconds.
//!   Overwritten on every run; the pipeline owns it.
//! - `editable` — full name, short name, role, persona, notes. The
//!   researcher owns it: a run fills only empty fields and never touches
//!   non-empty ones. Entries for sessions absent from the current run are
//!   retained, never deleted.
//!
//! The registry is also the authority for participant numbering: `p`
//! codes are globally unique for the life of the project, so the next
//! number is derived from the highest code ever recorded here, not from
//! whatever sessions happen to be in the current input folder.
//!
//! # TRADE-OFFS
//!
//! Serialized via `serde_yaml`, which drops any inline comments a
//! researcher wrote in the file. Preserving comments would need an
//! editing-capable YAML layer; the editable-block contract is the
//! mitigation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BristlenoseError;
use crate::model::Role;

fn is_empty(s: &str) -> bool {
    s.trim().is_empty()
}

/// Pipeline-owned facts about one speaker code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputedEntry {
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub words: u64,
    #[serde(default)]
    pub speaking_seconds: f64,
}

/// Researcher-owned fields; never overwritten when non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditableEntry {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub persona: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonEntry {
    #[serde(default)]
    pub computed: ComputedEntry,
    #[serde(default)]
    pub editable: EditableEntry,
}

/// The whole registry: code → entry. `BTreeMap` keeps the YAML sorted so
/// diffs stay readable under version control.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeopleRegistry {
    #[serde(default)]
    pub participants: BTreeMap<String, PersonEntry>,
}

/// Fresh facts for one speaker from the current run.
#[derive(Debug, Clone)]
pub struct SpeakerFacts {
    pub code: String,
    pub session_id: String,
    pub role: Role,
    pub words: u64,
    pub speaking_seconds: f64,
    /// Best available name, LLM extraction preferred over document metadata.
    pub person_name: Option<String>,
    pub job_title: Option<String>,
}

impl PeopleRegistry {
    /// Load the registry, returning an empty one when the file is absent.
    pub fn load(path: &Path) -> Result<PeopleRegistry, BristlenoseError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PeopleRegistry::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), BristlenoseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// The highest participant number ever assigned, 0 when none.
    ///
    /// WHY: `p` numbering must keep increasing across runs even when
    /// earlier sessions are no longer in the input folder, so the registry
    /// — not the current session set — is the source of truth.
    pub fn max_participant_number(&self) -> u32 {
        self.participants
            .keys()
            .filter_map(|code| code.strip_prefix('p'))
            .filter_map(|n| n.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
    }

    /// Merge the current run's facts into the registry.
    ///
    /// Computed blocks are replaced wholesale. Editable fields are filled
    /// only when currently empty. Entries not mentioned in `facts` are
    /// left untouched.
    pub fn merge_run(&mut self, facts: &[SpeakerFacts]) {
        for fact in facts {
            let entry = self.participants.entry(fact.code.clone()).or_default();
            entry.computed = ComputedEntry {
                session: fact.session_id.clone(),
                role: fact.role.to_string(),
                words: fact.words,
                speaking_seconds: fact.speaking_seconds,
            };
            if is_empty(&entry.editable.full_name) {
                if let Some(name) = &fact.person_name {
                    entry.editable.full_name = name.clone();
                }
            }
            if is_empty(&entry.editable.role) {
                entry.editable.role = fact.role.to_string();
            }
            if is_empty(&entry.editable.persona) {
                if let Some(title) = &fact.job_title {
                    entry.editable.persona = title.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(code: &str, name: Option<&str>) -> SpeakerFacts {
        SpeakerFacts {
            code: code.into(),
            session_id: "s1".into(),
            role: Role::Participant,
            words: 120,
            speaking_seconds: 64.5,
            person_name: name.map(String::from),
            job_title: None,
        }
    }

    #[test]
    fn test_empty_registry_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.yaml");
        let registry = PeopleRegistry::load(&path).unwrap();
        assert!(registry.participants.is_empty());
        registry.save(&path).unwrap();
        assert!(PeopleRegistry::load(&path).unwrap().participants.is_empty());
    }

    #[test]
    fn test_merge_fills_empty_editable_fields() {
        let mut registry = PeopleRegistry::default();
        registry.merge_run(&[facts("p1", Some("Priya Patel"))]);
        let entry = &registry.participants["p1"];
        assert_eq!(entry.editable.full_name, "Priya Patel");
        assert_eq!(entry.editable.role, "participant");
        assert_eq!(entry.computed.words, 120);
    }

    #[test]
    fn test_merge_never_overwrites_human_edits() {
        let mut registry = PeopleRegistry::default();
        registry.merge_run(&[facts("p1", Some("Priya Patel"))]);
        registry.participants.get_mut("p1").unwrap().editable.full_name =
            "Priya P. (returning)".into();
        registry.participants.get_mut("p1").unwrap().editable.notes = "loves shortcuts".into();

        registry.merge_run(&[facts("p1", Some("Priya Patel"))]);
        let entry = &registry.participants["p1"];
        assert_eq!(entry.editable.full_name, "Priya P. (returning)");
        assert_eq!(entry.editable.notes, "loves shortcuts");
    }

    #[test]
    fn test_merge_overwrites_computed_block() {
        let mut registry = PeopleRegistry::default();
        registry.merge_run(&[facts("p1", None)]);
        let mut updated = facts("p1", None);
        updated.words = 999;
        registry.merge_run(&[updated]);
        assert_eq!(registry.participants["p1"].computed.words, 999);
    }

    #[test]
    fn test_absent_entries_retained() {
        let mut registry = PeopleRegistry::default();
        registry.merge_run(&[facts("p1", None), facts("p2", None)]);
        // A later run with only p3 keeps p1 and p2
        registry.merge_run(&[facts("p3", None)]);
        assert_eq!(registry.participants.len(), 3);
    }

    #[test]
    fn test_max_participant_number() {
        let mut registry = PeopleRegistry::default();
        assert_eq!(registry.max_participant_number(), 0);
        registry.merge_run(&[facts("p1", None), facts("p7", None)]);
        registry.participants.entry("m1".into()).or_default();
        assert_eq!(registry.max_participant_number(), 7);
    }

    #[test]
    fn test_yaml_shape() {
        let mut registry = PeopleRegistry::default();
        registry.merge_run(&[facts("p1", Some("Priya Patel"))]);
        let yaml = serde_yaml::to_string(&registry).unwrap();
        assert!(yaml.contains("participants:"));
        assert!(yaml.contains("p1:"));
        assert!(yaml.contains("computed:"));
        assert!(yaml.contains("editable:"));
        let parsed: PeopleRegistry = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.participants["p1"].editable.full_name, "Priya Patel");
    }
}
