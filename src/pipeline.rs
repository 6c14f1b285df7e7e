//! Pipeline orchestrator.
//!
//! # Architecture overview
//!
//! `run` drives the stages in order, enforcing the concurrency bounds and
//! the failure policy:
//!
//! ```text
//! group → extract → transcribe → merge → speakers → redact
//!       → topics → quotes → (clusters ∥ themes)
//! ```
//!
//! Per-session stages fan out under a per-stage semaphore and join with
//! `join_all`, which preserves input order regardless of completion
//! order — quotes and boundaries always come out in session-ID order.
//! Cross-stage ordering is strict: a stage does not begin until the
//! previous stage's required outputs exist.
//!
//! After each stage the orchestrator persists the intermediate JSON and
//! the manifest, which is what makes a later invocation resumable. The
//! manifest is written by this module only.
//!
//! # Failure policy
//!
//! Decode, transcription, provider, and redaction errors are absorbed per
//! session: the manifest records the failure, a dimmed warning line goes
//! to stderr, and the other sessions continue. Cross-session stages
//! (clusters, themes) and manifest problems are fatal. Cancellation stops
//! new work, terminates subprocesses, persists the manifest, and
//! surfaces as an error so the process exits non-zero.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::cancel::CancelToken;
use crate::error::BristlenoseError;
use crate::extract;
use crate::grouper;
use crate::hash::hash_strings;
use crate::llm::usage::UsageTracker;
use crate::llm::LlmClient;
use crate::manifest::{stage, Manifest, StageStatus};
use crate::merge;
use crate::model::{Quote, QuoteScope, Segment, Session, TopicBoundary};
use crate::parsers;
use crate::people::PeopleRegistry;
use crate::quotes;
use crate::redact::Redactor;
use crate::speakers::{self, SessionSpeakers};
use crate::themes;
use crate::topics;
use crate::transcribe::{self, TranscriberConfig};
use crate::transcript_txt;
use crate::{clusters, config::Config};

pub struct PipelineOptions {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub provider: String,
    pub model: String,
    pub endpoint: Option<String>,
    pub concurrency: usize,
    pub redact_pii: bool,
    pub keep_wav: bool,
    /// Accept cached LLM-stage artefacts even when the requested provider
    /// differs from the recorded one.
    pub reuse_provider: bool,
    pub cache_llm_responses: bool,
    pub request_timeout: Duration,
    pub whisper_path: String,
    pub whisper_model: String,
    pub ffmpeg_path: String,
}

impl PipelineOptions {
    pub fn from_config(input_dir: PathBuf, config: &Config) -> PipelineOptions {
        let output_dir = config
            .output_path()
            .unwrap_or_else(|| input_dir.join("bristlenose-output"));
        PipelineOptions {
            input_dir,
            output_dir,
            provider: config.provider.clone().unwrap_or_else(|| "anthropic".into()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "claude-sonnet-4-20250514".into()),
            endpoint: config.endpoint.clone(),
            concurrency: config.concurrency(),
            redact_pii: config.redact_pii,
            keep_wav: config.keep_wav,
            reuse_provider: false,
            cache_llm_responses: config.cache_llm_responses,
            request_timeout: config.request_timeout(),
            whisper_path: config.whisper_path(),
            whisper_model: config.whisper_model(),
            ffmpeg_path: config.ffmpeg_path(),
        }
    }
}

/// Output-directory layout. All hidden state sits under `.bristlenose/`.
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(output_dir: &Path) -> Layout {
        Layout {
            root: output_dir.to_path_buf(),
        }
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join(".bristlenose/manifest.json")
    }
    pub fn intermediate(&self, name: &str) -> PathBuf {
        self.root.join(".bristlenose/intermediate").join(format!("{name}.json"))
    }
    pub fn llm_cache(&self) -> PathBuf {
        self.root.join(".bristlenose/cache/llm")
    }
    pub fn transcript_cache(&self) -> PathBuf {
        self.root.join(".bristlenose/cache/transcripts")
    }
    pub fn scratch(&self) -> PathBuf {
        self.root.join(".bristlenose/scratch")
    }
    pub fn raw_transcripts(&self) -> PathBuf {
        self.root.join("transcripts-raw")
    }
    pub fn cooked_transcripts(&self) -> PathBuf {
        self.root.join("transcripts-cooked")
    }
    pub fn people(&self) -> PathBuf {
        self.root.join("people.yaml")
    }
    pub fn redaction_audit(&self) -> PathBuf {
        self.root.join(".bristlenose/redaction-audit.json")
    }
}

/// What a completed run hands back to the CLI.
pub struct RunSummary {
    pub sessions: usize,
    pub session_failures: usize,
    pub quotes: usize,
    pub clusters: usize,
    pub themes: usize,
    pub usage_line: String,
}

fn progress_ok(name: &str, detail: &str, started: Instant) {
    eprintln!("✓ {name}: {detail} ({:.1}s)", started.elapsed().as_secs_f64());
}

fn progress_warn(detail: &str) {
    eprintln!("\x1b[2m  warning: {detail}\x1b[0m");
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), BristlenoseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Fingerprint a session's directory listing (names + sizes), the input
/// hash for the grouping and extraction stages.
fn listing_hash(sessions: &[Session]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for session in sessions {
        for path in &session.paths {
            let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            parts.push(format!("{}|{len}", path.display()));
        }
    }
    parts.sort();
    hash_strings(parts)
}

/// Content fingerprint of one session's segments, the per-session input
/// hash for the LLM stages.
fn segments_hash(segments: &[Segment]) -> String {
    hash_strings(
        segments
            .iter()
            .map(|s| format!("{:.3}|{}|{}", s.start, s.speaker_label, s.text)),
    )
}

fn quotes_hash(quotes: &[Quote]) -> String {
    hash_strings(quotes.iter().map(|q| format!("{:.3}|{}|{}", q.time, q.speaker_code, q.text)))
}

/// Per-session working state threaded through the stages.
struct SessionData {
    session: Session,
    /// Segment lists per source, folded to one list by the merge stage.
    sources: Vec<Vec<Segment>>,
    segments: Vec<Segment>,
    identities: Option<SessionSpeakers>,
    boundaries: Vec<TopicBoundary>,
    /// First unrecoverable per-session error; later stages skip the session.
    failed: Option<String>,
}

impl SessionData {
    fn alive(&self) -> bool {
        self.failed.is_none()
    }
}

/// Read-only status summary from the manifest.
pub fn status(output_dir: &Path) -> Result<String, BristlenoseError> {
    let layout = Layout::new(output_dir);
    let manifest = Manifest::load(&layout.manifest())?.ok_or_else(|| {
        BristlenoseError::Other(format!(
            "No manifest found under {} — has the pipeline run here?",
            output_dir.display()
        ))
    })?;
    let artefacts: Vec<(&str, PathBuf)> = vec![
        (stage::GROUP, layout.intermediate("sessions")),
        (stage::MERGE, layout.intermediate("segments")),
        (stage::SPEAKERS, layout.intermediate("speakers")),
        (stage::TOPICS, layout.intermediate("topic-boundaries")),
        (stage::QUOTES, layout.intermediate("extracted-quotes")),
        (stage::CLUSTERS, layout.intermediate("screen-clusters")),
        (stage::THEMES, layout.intermediate("themes")),
    ];
    Ok(crate::manifest::status_report(&manifest, &artefacts))
}

/// The leading line printed when an earlier run left a partial manifest.
fn resume_summary(manifest: &Manifest, total_sessions: usize) -> Option<String> {
    let record = manifest.stage(stage::QUOTES)?;
    if record.sessions.is_empty() {
        return None;
    }
    let done = record
        .sessions
        .values()
        .filter(|s| s.status == StageStatus::Complete)
        .count();
    let remaining = total_sessions.saturating_sub(done);
    Some(format!(
        "Resuming: {done}/{total_sessions} sessions have quotes, {remaining} remaining"
    ))
}

/// Run the full pipeline. See the module docs for the failure policy.
pub async fn run(
    options: PipelineOptions,
    cancel: CancelToken,
) -> Result<RunSummary, BristlenoseError> {
    let layout = Layout::new(&options.output_dir);
    let project = options
        .input_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project")
        .to_string();

    let mut manifest = match Manifest::load(&layout.manifest())? {
        Some(m) => m,
        None => Manifest::new(&project),
    };

    let tracker = Arc::new(UsageTracker::new(
        Config::load().pricing.map(|p| crate::llm::usage::TokenPrice {
            input: p.input,
            output: p.output,
        }),
    ));
    let client = LlmClient::new(
        &options.provider,
        &options.model,
        options.endpoint.as_deref(),
        options.request_timeout,
        tracker.clone(),
        options.cache_llm_responses.then(|| layout.llm_cache()),
    )?;
    let fingerprint = client.fingerprint();
    tracing::info!(
        provider = %fingerprint,
        credential = %client.credential_source(),
        "pipeline starting"
    );

    // ── Stage 1: grouping ────────────────────────────────────────────────
    let started = Instant::now();
    let sessions = grouper::group_sessions(&options.input_dir)?;
    let listing = listing_hash(&sessions);
    manifest.begin_stage(stage::GROUP, None, &listing);
    manifest.finish_stage(stage::GROUP);
    write_json(&layout.intermediate("sessions"), &sessions)?;
    progress_ok(
        "group",
        &format!("{} sessions from {}", sessions.len(), options.input_dir.display()),
        started,
    );

    if let Some(line) = resume_summary(&manifest, sessions.len()) {
        eprintln!("{line}");
    }

    let mut data: Vec<SessionData> = sessions
        .into_iter()
        .map(|session| SessionData {
            session,
            sources: Vec::new(),
            segments: Vec::new(),
            identities: None,
            boundaries: Vec::new(),
            failed: None,
        })
        .collect();

    // ── Stage 2: audio extraction ────────────────────────────────────────
    let started = Instant::now();
    let session_list: Vec<Session> = data.iter().map(|d| d.session.clone()).collect();
    manifest.begin_stage(stage::EXTRACT, None, &listing);
    let extraction = extract::extract_sessions(
        &session_list,
        &layout.scratch(),
        &options.ffmpeg_path,
        &cancel,
    )
    .await;
    let mut wavs_by_session: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut extracted = 0usize;
    for (sid, result) in extraction {
        match result {
            Ok(wavs) => {
                if !wavs.is_empty() {
                    extracted += 1;
                }
                wavs_by_session.insert(sid, wavs);
            }
            Err(BristlenoseError::Cancelled) => {
                manifest.save(&layout.manifest())?;
                return Err(BristlenoseError::Cancelled);
            }
            Err(e) => {
                progress_warn(&format!("{sid} audio extraction failed: {e}"));
                manifest.record_session_failed(stage::EXTRACT, &sid, &e.to_string());
                mark_failed(&mut data, &sid, &e.to_string());
            }
        }
    }
    manifest.finish_stage(stage::EXTRACT);
    manifest.save(&layout.manifest())?;
    progress_ok("extract", &format!("{extracted} sessions decoded"), started);

    // ── Stages 3–5: parse documents, transcribe audio ────────────────────
    let started = Instant::now();
    manifest.begin_stage(stage::TRANSCRIBE, Some(&options.whisper_model), &listing);
    let transcriber = TranscriberConfig {
        whisper_path: options.whisper_path.clone(),
        model: options.whisper_model.clone(),
    };
    let mut transcribed = 0usize;
    let mut parsed = 0usize;
    for item in data.iter_mut() {
        if !item.alive() {
            continue;
        }
        if cancel.is_cancelled() {
            manifest.save(&layout.manifest())?;
            return Err(BristlenoseError::Cancelled);
        }

        // Existing transcripts parse first; they also suppress transcription.
        for path in item.session.transcript_paths() {
            match parsers::parse_transcript_file(path) {
                Ok(mut segments) => {
                    for seg in &mut segments {
                        seg.session_id = item.session.id.clone();
                    }
                    item.sources.push(segments);
                }
                Err(e) => {
                    progress_warn(&format!(
                        "{}: {} did not parse: {e}",
                        item.session.id,
                        path.display()
                    ));
                }
            }
        }
        if !item.sources.is_empty() {
            parsed += 1;
        }

        // Transcription is sequential: one accelerator, one queue.
        let wavs = wavs_by_session
            .get(&item.session.id)
            .cloned()
            .unwrap_or_default();
        if item.session.has_existing_transcript || wavs.is_empty() {
            continue;
        }
        match transcribe::transcribe_session(
            &item.session,
            &wavs,
            &layout.transcript_cache(),
            &transcriber,
            &cancel,
        )
        .await
        {
            Ok(segments) => {
                let hash = segments_hash(&segments);
                manifest.record_session_ok(
                    stage::TRANSCRIBE,
                    &item.session.id,
                    Some(&options.whisper_model),
                    &hash,
                );
                item.sources.push(segments);
                transcribed += 1;
            }
            Err(BristlenoseError::Cancelled) => {
                manifest.save(&layout.manifest())?;
                return Err(BristlenoseError::Cancelled);
            }
            Err(e) => {
                progress_warn(&format!("{} transcription failed: {e}", item.session.id));
                manifest.record_session_failed(stage::TRANSCRIBE, &item.session.id, &e.to_string());
                item.failed = Some(e.to_string());
            }
        }
    }
    manifest.finish_stage(stage::TRANSCRIBE);
    manifest.save(&layout.manifest())?;
    progress_ok(
        "transcribe",
        &format!("{transcribed} transcribed, {parsed} from documents"),
        started,
    );

    // ── Stage 6: merge ───────────────────────────────────────────────────
    let started = Instant::now();
    manifest.begin_stage(stage::MERGE, None, &listing);
    for item in data.iter_mut() {
        if !item.alive() {
            continue;
        }
        let sources = std::mem::take(&mut item.sources);
        item.segments = merge::merge_sources(sources);
        if item.segments.is_empty() && item.alive() {
            let message = "no usable transcript from any source".to_string();
            progress_warn(&format!("{}: {message}", item.session.id));
            item.failed = Some(message);
            continue;
        }
        item.session.duration_seconds = item
            .segments
            .last()
            .map(|s| s.end)
            .unwrap_or(0.0);
    }
    manifest.finish_stage(stage::MERGE);
    progress_ok(
        "merge",
        &format!("{} sessions merged", data.iter().filter(|d| d.alive()).count()),
        started,
    );

    // ── Stage 5b: speaker identification ─────────────────────────────────
    let started = Instant::now();
    manifest.begin_stage(stage::SPEAKERS, Some(&fingerprint), &listing);
    let prior_speakers: BTreeMap<String, SessionSpeakers> =
        read_json(&layout.intermediate("speakers")).unwrap_or_default();

    {
        let semaphore = Semaphore::new(options.concurrency);
        let futures = data.iter().map(|item| {
            let semaphore = &semaphore;
            let client = &client;
            let prior = &prior_speakers;
            let manifest_ref = &manifest;
            let reuse = options.reuse_provider;
            let fp = fingerprint.clone();
            async move {
                if !item.alive() || item.segments.is_empty() {
                    return None;
                }
                let hash = segments_hash(&item.segments);
                if manifest_ref.should_skip_session(
                    stage::SPEAKERS,
                    &item.session.id,
                    &hash,
                    Some(&fp),
                    prior.contains_key(&item.session.id),
                    reuse,
                ) {
                    return Some((item.session.id.clone(), hash, Ok(prior[&item.session.id].clone())));
                }
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = speakers::identify_speakers(client, &item.session, &item.segments).await;
                Some((item.session.id.clone(), hash, result))
            }
        });
        let results = join_all(futures).await;

        let mut identities: Vec<SessionSpeakers> = Vec::new();
        for (item, outcome) in data.iter_mut().zip(results) {
            let Some((sid, hash, result)) = outcome else {
                continue;
            };
            let mut resolved = match result {
                Ok(resolved) => resolved,
                Err(e) => {
                    // LLM failure degrades to heuristics; never aborts.
                    progress_warn(&format!("{sid} speaker refinement fell back to heuristics: {e}"));
                    speakers::heuristic_identities(&sid, &item.segments)
                }
            };
            // Codes from a previous run are immutable; re-attach before
            // assignment fills the gaps.
            if let Some(prior) = prior_speakers.get(&sid) {
                for speaker in &mut resolved.speakers {
                    if let Some(code) = prior.code_for(&speaker.label) {
                        speaker.code = code.to_string();
                    }
                }
            }
            manifest.record_session_ok(stage::SPEAKERS, &sid, Some(&fingerprint), &hash);
            identities.push(resolved);
        }

        let registry_path = layout.people();
        let mut registry = PeopleRegistry::load(&registry_path)?;
        speakers::assign_codes(&mut identities, registry.max_participant_number() + 1);

        let mut by_session: BTreeMap<String, SessionSpeakers> = prior_speakers.clone();
        for resolved in identities {
            by_session.insert(resolved.session_id.clone(), resolved);
        }
        for item in data.iter_mut() {
            if let Some(resolved) = by_session.get(&item.session.id) {
                speakers::resolve_segments(&mut item.segments, resolved);
                let facts = speakers::speaker_facts(resolved, &item.segments);
                registry.merge_run(&facts);
                item.identities = Some(resolved.clone());
            }
        }
        registry.save(&registry_path)?;
        write_json(&layout.intermediate("speakers"), &by_session)?;
    }
    manifest.finish_stage(stage::SPEAKERS);
    manifest.save(&layout.manifest())?;
    progress_ok(
        "speakers",
        &format!(
            "{} sessions identified",
            data.iter().filter(|d| d.identities.is_some()).count()
        ),
        started,
    );

    // Word timings have served merging and identification; drop them.
    for item in data.iter_mut() {
        merge::prune_word_timings(&mut item.segments);
    }
    let segments_map: BTreeMap<String, Vec<Segment>> = data
        .iter()
        .filter(|d| d.alive())
        .map(|d| (d.session.id.clone(), d.segments.clone()))
        .collect();
    write_json(&layout.intermediate("segments"), &segments_map)?;

    // Raw transcripts on disk, codes not names.
    for item in data.iter().filter(|d| d.alive()) {
        transcript_txt::write_session_files(&layout.raw_transcripts(), &item.session, &item.segments)?;
    }

    // ── Stage 7: PII redaction (opt-in) ──────────────────────────────────
    if options.redact_pii {
        let started = Instant::now();
        manifest.begin_stage(stage::REDACT, None, &listing);
        let known_names: Vec<String> = data
            .iter()
            .filter_map(|d| d.identities.as_ref())
            .flat_map(|ids| ids.speakers.iter().filter_map(|s| s.person_name.clone()))
            .collect();
        let mut redactor = Redactor::new(&known_names);
        let mut audit = Vec::new();
        for item in data.iter().filter(|d| d.alive()) {
            let outcome = redactor.redact_segments(&item.segments);
            transcript_txt::write_session_files(
                &layout.cooked_transcripts(),
                &item.session,
                &outcome.segments,
            )?;
            audit.extend(outcome.audit);
        }
        write_json(&layout.redaction_audit(), &audit)?;
        manifest.finish_stage(stage::REDACT);
        progress_ok("redact", &format!("{} replacements", audit.len()), started);
    }

    // ── Stage 8: topic segmentation ──────────────────────────────────────
    if cancel.is_cancelled() {
        manifest.save(&layout.manifest())?;
        return Err(BristlenoseError::Cancelled);
    }
    let started = Instant::now();
    manifest.begin_stage(stage::TOPICS, Some(&fingerprint), &listing);
    let prior_boundaries: BTreeMap<String, Vec<TopicBoundary>> =
        read_json(&layout.intermediate("topic-boundaries")).unwrap_or_default();
    {
        let semaphore = Semaphore::new(options.concurrency);
        let futures = data.iter().map(|item| {
            let semaphore = &semaphore;
            let client = &client;
            let prior = &prior_boundaries;
            let manifest_ref = &manifest;
            let reuse = options.reuse_provider;
            let fp = fingerprint.clone();
            async move {
                if !item.alive() {
                    return None;
                }
                let hash = segments_hash(&item.segments);
                if manifest_ref.should_skip_session(
                    stage::TOPICS,
                    &item.session.id,
                    &hash,
                    Some(&fp),
                    prior.contains_key(&item.session.id),
                    reuse,
                ) {
                    return Some((hash, Ok(prior[&item.session.id].clone())));
                }
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = topics::segment_topics(client, &item.session, &item.segments).await;
                Some((hash, result))
            }
        });
        let results = join_all(futures).await;
        for (item, outcome) in data.iter_mut().zip(results) {
            let Some((hash, result)) = outcome else { continue };
            match result {
                Ok(boundaries) => {
                    manifest.record_session_ok(stage::TOPICS, &item.session.id, Some(&fingerprint), &hash);
                    item.boundaries = boundaries;
                }
                Err(e) => {
                    // Stage 9 still runs with the implicit boundary at 0.
                    progress_warn(&format!("{} topic segmentation failed: {e}", item.session.id));
                    manifest.record_session_failed(stage::TOPICS, &item.session.id, &e.to_string());
                    item.boundaries = Vec::new();
                }
            }
        }
    }
    let boundaries_map: BTreeMap<String, Vec<TopicBoundary>> = data
        .iter()
        .filter(|d| d.alive())
        .map(|d| (d.session.id.clone(), d.boundaries.clone()))
        .collect();
    write_json(&layout.intermediate("topic-boundaries"), &boundaries_map)?;
    manifest.finish_stage(stage::TOPICS);
    manifest.save(&layout.manifest())?;
    progress_ok(
        "topics",
        &format!(
            "{} boundary lists",
            data.iter().filter(|d| !d.boundaries.is_empty()).count()
        ),
        started,
    );

    // ── Stage 9: quote extraction ────────────────────────────────────────
    if cancel.is_cancelled() {
        manifest.save(&layout.manifest())?;
        return Err(BristlenoseError::Cancelled);
    }
    let started = Instant::now();
    manifest.begin_stage(stage::QUOTES, Some(&fingerprint), &listing);
    let prior_quotes: BTreeMap<String, Vec<Quote>> =
        read_json(&layout.intermediate("session-quotes")).unwrap_or_default();
    let mut quotes_by_session: BTreeMap<String, Vec<Quote>> = BTreeMap::new();
    {
        let semaphore = Semaphore::new(options.concurrency);
        let futures = data.iter().map(|item| {
            let semaphore = &semaphore;
            let client = &client;
            let prior = &prior_quotes;
            let manifest_ref = &manifest;
            let reuse = options.reuse_provider;
            let fp = fingerprint.clone();
            async move {
                let Some(identities) = item.identities.as_ref() else {
                    return None;
                };
                if !item.alive() {
                    return None;
                }
                // Boundaries are part of this stage's input.
                let hash = hash_strings([
                    segments_hash(&item.segments),
                    hash_strings(item.boundaries.iter().map(|b| format!("{:.3}|{}", b.time, b.label))),
                ]);
                if manifest_ref.should_skip_session(
                    stage::QUOTES,
                    &item.session.id,
                    &hash,
                    Some(&fp),
                    prior.contains_key(&item.session.id),
                    reuse,
                ) {
                    return Some((hash, Ok(prior[&item.session.id].clone())));
                }
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let effective: Vec<TopicBoundary> = if item.boundaries.is_empty() {
                    vec![topics::fallback_boundary(&item.session.id)]
                } else {
                    item.boundaries.clone()
                };
                let result = quotes::extract_quotes(
                    client,
                    &item.session,
                    &item.segments,
                    &effective,
                    identities,
                )
                .await;
                Some((hash, result))
            }
        });
        let results = join_all(futures).await;
        for (item, outcome) in data.iter().zip(results) {
            let Some((hash, result)) = outcome else { continue };
            match result {
                Ok(session_quotes) => {
                    manifest.record_session_ok(stage::QUOTES, &item.session.id, Some(&fingerprint), &hash);
                    quotes_by_session.insert(item.session.id.clone(), session_quotes);
                }
                Err(e) => {
                    progress_warn(&format!("{} quote extraction failed: {e}", item.session.id));
                    manifest.record_session_failed(stage::QUOTES, &item.session.id, &e.to_string());
                    quotes_by_session.insert(item.session.id.clone(), Vec::new());
                }
            }
        }
    }
    write_json(&layout.intermediate("session-quotes"), &quotes_by_session)?;

    // Concatenate in session-ID order (data is already in that order).
    let all_quotes: Vec<Quote> = data
        .iter()
        .filter_map(|d| quotes_by_session.get(&d.session.id))
        .flatten()
        .cloned()
        .collect();
    write_json(&layout.intermediate("extracted-quotes"), &all_quotes)?;
    manifest.finish_stage(stage::QUOTES);
    manifest.save(&layout.manifest())?;
    progress_ok("quotes", &format!("{} quotes extracted", all_quotes.len()), started);

    // ── Stages 10 & 11: clusters and themes, concurrently ────────────────
    if cancel.is_cancelled() {
        manifest.save(&layout.manifest())?;
        return Err(BristlenoseError::Cancelled);
    }
    let started = Instant::now();
    let screen_quotes: Vec<Quote> = all_quotes
        .iter()
        .filter(|q| q.scope == QuoteScope::ScreenSpecific)
        .cloned()
        .collect();
    let general_quotes: Vec<Quote> = all_quotes
        .iter()
        .filter(|q| q.scope == QuoteScope::GeneralContext)
        .cloned()
        .collect();

    let cluster_hash = quotes_hash(&screen_quotes);
    let theme_hash = quotes_hash(&general_quotes);
    let clusters_path = layout.intermediate("screen-clusters");
    let themes_path = layout.intermediate("themes");

    let skip_clusters = manifest.should_skip_stage(
        stage::CLUSTERS,
        &cluster_hash,
        Some(&fingerprint),
        clusters_path.exists(),
        options.reuse_provider,
    );
    let skip_themes = manifest.should_skip_stage(
        stage::THEMES,
        &theme_hash,
        Some(&fingerprint),
        themes_path.exists(),
        options.reuse_provider,
    );

    let (cluster_result, theme_result) = tokio::join!(
        async {
            if skip_clusters {
                read_json(&clusters_path)
                    .ok_or_else(|| BristlenoseError::Manifest("screen-clusters artefact unreadable".into()))
            } else {
                clusters::cluster_screens(&client, &screen_quotes).await
            }
        },
        async {
            if skip_themes {
                read_json(&themes_path)
                    .ok_or_else(|| BristlenoseError::Manifest("themes artefact unreadable".into()))
            } else {
                themes::group_themes(&client, &general_quotes).await
            }
        },
    );

    // Cross-session stages are fatal on failure.
    let screen_clusters = match cluster_result {
        Ok(v) => v,
        Err(e) => {
            manifest.stage_mut(stage::CLUSTERS).status = StageStatus::Failed;
            manifest.save(&layout.manifest())?;
            return Err(e);
        }
    };
    let theme_groups = match theme_result {
        Ok(v) => v,
        Err(e) => {
            manifest.stage_mut(stage::THEMES).status = StageStatus::Failed;
            manifest.save(&layout.manifest())?;
            return Err(e);
        }
    };

    if !skip_clusters {
        manifest.begin_stage(stage::CLUSTERS, Some(&fingerprint), &cluster_hash);
        write_json(&clusters_path, &screen_clusters)?;
        manifest.finish_stage(stage::CLUSTERS);
    }
    if !skip_themes {
        manifest.begin_stage(stage::THEMES, Some(&fingerprint), &theme_hash);
        write_json(&themes_path, &theme_groups)?;
        manifest.finish_stage(stage::THEMES);
    }
    progress_ok(
        "analyse",
        &format!("{} screen clusters, {} themes", screen_clusters.len(), theme_groups.len()),
        started,
    );

    // ── Wrap-up ──────────────────────────────────────────────────────────
    manifest.total_cost_usd = tracker.total_cost();
    manifest.save(&layout.manifest())?;

    if !options.keep_wav {
        if let Err(e) = std::fs::remove_dir_all(layout.scratch()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "could not clean scratch directory");
            }
        }
    }

    let session_failures = data.iter().filter(|d| !d.alive()).count();
    Ok(RunSummary {
        sessions: data.len(),
        session_failures,
        quotes: all_quotes.len(),
        clusters: screen_clusters.len(),
        themes: theme_groups.len(),
        usage_line: tracker.summary_line(),
    })
}

fn mark_failed(data: &mut [SessionData], session_id: &str, message: &str) {
    if let Some(item) = data.iter_mut().find(|d| d.session.id == session_id) {
        item.failed = Some(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Platform;

    fn session(id: &str) -> Session {
        Session {
            id: id.into(),
            title: id.into(),
            platform: Platform::Generic,
            paths: vec![],
            started_at: None,
            duration_seconds: 60.0,
            has_existing_transcript: true,
        }
    }

    fn seg(sid: &str, start: f64, text: &str) -> Segment {
        Segment {
            session_id: sid.into(),
            start,
            end: start + 2.0,
            text: text.into(),
            speaker_label: "A".into(),
            speaker_code: Some("p1".into()),
            role: None,
            words: vec![],
        }
    }

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new(Path::new("/out"));
        assert_eq!(layout.manifest(), Path::new("/out/.bristlenose/manifest.json"));
        assert_eq!(
            layout.intermediate("topic-boundaries"),
            Path::new("/out/.bristlenose/intermediate/topic-boundaries.json")
        );
        assert_eq!(layout.people(), Path::new("/out/people.yaml"));
        assert_eq!(layout.raw_transcripts(), Path::new("/out/transcripts-raw"));
    }

    #[test]
    fn test_segments_hash_sensitivity() {
        let a = vec![seg("s1", 0.0, "hello")];
        let b = vec![seg("s1", 0.0, "hello there")];
        assert_eq!(segments_hash(&a), segments_hash(&a));
        assert_ne!(segments_hash(&a), segments_hash(&b));
    }

    #[test]
    fn test_listing_hash_order_independent() {
        let mut s1 = session("s1");
        s1.paths = vec![PathBuf::from("/x/a.mp4"), PathBuf::from("/x/b.vtt")];
        let mut s2 = session("s1");
        s2.paths = vec![PathBuf::from("/x/b.vtt"), PathBuf::from("/x/a.mp4")];
        assert_eq!(listing_hash(&[s1]), listing_hash(&[s2]));
    }

    #[test]
    fn test_resume_summary_counts_completed_quotes() {
        let mut manifest = Manifest::new("p");
        manifest.begin_stage(stage::QUOTES, Some("fp"), "h");
        manifest.record_session_ok(stage::QUOTES, "s1", Some("fp"), "h1");
        manifest.record_session_ok(stage::QUOTES, "s2", Some("fp"), "h2");
        manifest.record_session_failed(stage::QUOTES, "s3", "boom");
        manifest.finish_stage(stage::QUOTES);

        let line = resume_summary(&manifest, 10).unwrap();
        assert_eq!(line, "Resuming: 2/10 sessions have quotes, 8 remaining");
    }

    #[test]
    fn test_resume_summary_absent_without_history() {
        let manifest = Manifest::new("p");
        assert!(resume_summary(&manifest, 5).is_none());
    }

    #[test]
    fn test_write_read_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/value.json");
        let value: Vec<Quote> = vec![];
        write_json(&path, &value).unwrap();
        let back: Option<Vec<Quote>> = read_json(&path);
        assert_eq!(back.unwrap().len(), 0);
        let missing: Option<Vec<Quote>> = read_json(&dir.path().join("absent.json"));
        assert!(missing.is_none());
    }

    #[test]
    fn test_status_without_manifest_is_descriptive() {
        let dir = tempfile::tempdir().unwrap();
        let err = status(dir.path()).unwrap_err();
        assert!(err.to_string().contains("No manifest"));
    }
}
