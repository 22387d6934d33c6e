//! Append-only SQLite result store.
//!
//! `ResultStore` is the single source of historical truth for generation
//! attempts, their subjective evaluations and the published weight vectors.
//! Rows are never deleted and never rewritten; the only permitted mutation is
//! setting `exclusion_reason` once, from NULL to a value. The schema enforces
//! this with triggers so that no code path can bypass it.
//!
//! Every query method here returns qualifying records only
//! (`exclusion_reason IS NULL`). Excluded records are reachable exclusively
//! through [`ResultStore::audit`].

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::types::{
    Confidence, DetectionMethod, ExclusionReason, GenerationAttempt, GenerationParameters,
    SubjectiveEvaluation, WeightVector, Weights,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generation_attempts (
    id                 TEXT PRIMARY KEY,
    request_id         TEXT NOT NULL,
    subject_key        TEXT NOT NULL,
    component_type     TEXT NOT NULL,
    attempt_number     INTEGER NOT NULL,
    parameters_version INTEGER NOT NULL,
    parameters         TEXT NOT NULL,
    content            TEXT NOT NULL,
    detection_score    REAL NOT NULL,
    detection_method   TEXT NOT NULL,
    subjective_score   REAL NOT NULL,
    readability_score  REAL NOT NULL,
    composite_score    REAL NOT NULL,
    success            INTEGER NOT NULL,
    exclusion_reason   TEXT,
    created_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempts_subject
    ON generation_attempts (subject_key, component_type, created_at);
CREATE INDEX IF NOT EXISTS idx_attempts_composite
    ON generation_attempts (composite_score);

CREATE TABLE IF NOT EXISTS subjective_evaluations (
    attempt_id         TEXT PRIMARY KEY REFERENCES generation_attempts (id),
    narrative          TEXT NOT NULL,
    realism_score      REAL NOT NULL,
    voice_authenticity REAL NOT NULL,
    tonal_consistency  REAL NOT NULL,
    ai_tendencies      TEXT NOT NULL,
    created_at         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS weight_vectors (
    version      INTEGER PRIMARY KEY,
    detection    REAL NOT NULL,
    subjective   REAL NOT NULL,
    readability  REAL NOT NULL,
    confidence   TEXT NOT NULL,
    sample_size  INTEGER NOT NULL,
    last_updated TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS generation_attempts_no_delete
BEFORE DELETE ON generation_attempts
BEGIN
    SELECT RAISE(ABORT, 'generation_attempts is append-only');
END;

CREATE TRIGGER IF NOT EXISTS generation_attempts_immutable
BEFORE UPDATE OF id, request_id, subject_key, component_type, attempt_number,
    parameters_version, parameters, content, detection_score, detection_method,
    subjective_score, readability_score, composite_score, success, created_at
ON generation_attempts
BEGIN
    SELECT RAISE(ABORT, 'generation_attempts fields are immutable');
END;

CREATE TRIGGER IF NOT EXISTS generation_attempts_exclusion_once
BEFORE UPDATE OF exclusion_reason ON generation_attempts
WHEN OLD.exclusion_reason IS NOT NULL
BEGIN
    SELECT RAISE(ABORT, 'exclusion_reason is already set');
END;

CREATE TRIGGER IF NOT EXISTS subjective_evaluations_no_delete
BEFORE DELETE ON subjective_evaluations
BEGIN
    SELECT RAISE(ABORT, 'subjective_evaluations is append-only');
END;

CREATE TRIGGER IF NOT EXISTS subjective_evaluations_immutable
BEFORE UPDATE ON subjective_evaluations
BEGIN
    SELECT RAISE(ABORT, 'subjective_evaluations is append-only');
END;

CREATE TRIGGER IF NOT EXISTS weight_vectors_no_delete
BEFORE DELETE ON weight_vectors
BEGIN
    SELECT RAISE(ABORT, 'weight_vectors is append-only');
END;

CREATE TRIGGER IF NOT EXISTS weight_vectors_immutable
BEFORE UPDATE ON weight_vectors
BEGIN
    SELECT RAISE(ABORT, 'weight_vectors is append-only');
END;
"#;

const ATTEMPT_COLUMNS: &str = "id, request_id, subject_key, component_type, attempt_number, \
     parameters_version, parameters, content, detection_score, detection_method, \
     subjective_score, readability_score, composite_score, success, exclusion_reason, created_at";

/// Top-performing qualifying attempts and the corpus size they were drawn from.
#[derive(Debug, Clone, Default)]
pub struct TopPerformers {
    /// Qualifying attempts considered (before the percentile cut).
    pub sample_size: usize,
    /// Best attempts by composite score; empty when `sample_size` was below the minimum.
    pub attempts: Vec<GenerationAttempt>,
}

/// What [`ResultStore::insert_classified`] committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredAttempt {
    /// `false` when the attempt id was already stored and nothing was written.
    pub inserted: bool,
    /// Exclusion reason the attempt carries after the call.
    pub exclusion_reason: Option<ExclusionReason>,
    /// Previously qualifying records excluded together with the attempt.
    pub also_excluded: usize,
}

/// Contamination verdict for a new attempt: the reason and every record it
/// applies to (the attempt itself and any earlier records it implicates).
pub type Verdict = (ExclusionReason, Vec<Uuid>);

/// Durable, append-only store of attempts and evaluations.
pub struct ResultStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl ResultStore {
    /// Open (or create) a file-backed store and apply the schema.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| PersistenceError::Sqlite {
                    message: format!("cannot create {}: {e}", parent.display()),
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, PersistenceError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = ?path, "Result store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::LockPoisoned)
    }

    /// Persist an attempt. Idempotent per attempt id: returns `false` when a
    /// row with the same id already exists (the stored row is left untouched).
    pub fn insert(&self, attempt: &GenerationAttempt) -> Result<bool, PersistenceError> {
        let conn = self.conn()?;
        let changed = insert_attempt_row(&conn, attempt, attempt.exclusion_reason.as_ref())?;
        if changed == 0 {
            tracing::debug!(attempt_id = %attempt.id, "Attempt already stored, insert skipped");
        }
        Ok(changed > 0)
    }

    /// Persist the evaluation belonging to an already-stored attempt.
    pub fn insert_evaluation(
        &self,
        evaluation: &SubjectiveEvaluation,
    ) -> Result<bool, PersistenceError> {
        let conn = self.conn()?;
        Ok(insert_evaluation_row(&conn, evaluation)? > 0)
    }

    /// Persist a scored attempt, its evaluation and its contamination verdict
    /// as one transaction.
    ///
    /// `classify` sees the attempt and up to `history_limit` of the newest
    /// qualifying records for the same subject/component. The attempt is
    /// written with its own verdict already applied and implicated earlier
    /// records are excluded in the same transaction, so no reader ever
    /// observes the attempt unclassified. Any failure rolls everything back.
    pub fn insert_classified<F>(
        &self,
        attempt: &GenerationAttempt,
        evaluation: &SubjectiveEvaluation,
        history_limit: usize,
        classify: F,
    ) -> Result<StoredAttempt, PersistenceError>
    where
        F: FnOnce(&GenerationAttempt, &[GenerationAttempt]) -> Option<Verdict>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: Option<Option<String>> = tx
            .query_row(
                "SELECT exclusion_reason FROM generation_attempts WHERE id = ?1",
                params![attempt.id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(reason) = existing {
            tracing::debug!(attempt_id = %attempt.id, "Attempt already stored, insert skipped");
            return Ok(StoredAttempt {
                inserted: false,
                exclusion_reason: reason.map(ExclusionReason::from),
                also_excluded: 0,
            });
        }

        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM generation_attempts
             WHERE subject_key = ?1 AND component_type = ?2 AND exclusion_reason IS NULL
             ORDER BY created_at DESC, id
             LIMIT ?3"
        );
        let history = select_attempts(
            &tx,
            &sql,
            params![attempt.subject_key, attempt.component_type, history_limit as i64],
        )?;
        let verdict = classify(attempt, &history);

        let own_reason = verdict
            .as_ref()
            .filter(|(_, ids)| ids.contains(&attempt.id))
            .map(|(reason, _)| reason.clone());
        insert_attempt_row(&tx, attempt, own_reason.as_ref())?;
        insert_evaluation_row(&tx, evaluation)?;

        let mut also_excluded = 0;
        if let Some((reason, ids)) = &verdict {
            for id in ids.iter().filter(|id| **id != attempt.id) {
                also_excluded += exclude_row(&tx, *id, reason)?;
            }
        }
        tx.commit()?;

        Ok(StoredAttempt {
            inserted: true,
            exclusion_reason: own_reason,
            also_excluded,
        })
    }

    /// Annotate a record as untrustworthy for learning.
    ///
    /// Returns `false` when the record was already excluded (the first reason
    /// wins) or does not exist.
    pub fn mark_excluded(
        &self,
        id: Uuid,
        reason: &ExclusionReason,
    ) -> Result<bool, PersistenceError> {
        let conn = self.conn()?;
        Ok(exclude_row(&conn, id, reason)? > 0)
    }

    /// A qualifying attempt by id.
    pub fn get_attempt(&self, id: Uuid) -> Result<Option<GenerationAttempt>, PersistenceError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM generation_attempts
             WHERE id = ?1 AND exclusion_reason IS NULL"
        );
        self.query_one(&sql, params![id.to_string()])
    }

    /// The evaluation stored for an attempt.
    pub fn get_evaluation(
        &self,
        attempt_id: Uuid,
    ) -> Result<Option<SubjectiveEvaluation>, PersistenceError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT attempt_id, narrative, realism_score, voice_authenticity,
                        tonal_consistency, ai_tendencies, created_at
                 FROM subjective_evaluations WHERE attempt_id = ?1",
                params![attempt_id.to_string()],
                |r| {
                    Ok(EvaluationRow {
                        attempt_id: r.get(0)?,
                        narrative: r.get(1)?,
                        realism_score: r.get(2)?,
                        voice_authenticity: r.get(3)?,
                        tonal_consistency: r.get(4)?,
                        ai_tendencies: r.get(5)?,
                        created_at: r.get(6)?,
                    })
                },
            )
            .optional()?;
        row.map(SubjectiveEvaluation::try_from).transpose()
    }

    /// Most recent qualifying, successful attempt for a subject/component pair
    /// with the given parameter schema version.
    pub fn query_best_previous(
        &self,
        subject_key: &str,
        component_type: &str,
        parameters_version: u32,
    ) -> Result<Option<GenerationAttempt>, PersistenceError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM generation_attempts
             WHERE subject_key = ?1 AND component_type = ?2 AND parameters_version = ?3
               AND success = 1 AND exclusion_reason IS NULL
             ORDER BY created_at DESC, composite_score DESC, id
             LIMIT 1"
        );
        self.query_one(&sql, params![subject_key, component_type, parameters_version])
    }

    /// The top `percentile` fraction (by composite score) of qualifying
    /// attempts with the given parameter schema version.
    ///
    /// Returns no attempts when fewer than `min_samples` qualifying records
    /// exist, but always reports the sample size.
    pub fn query_top_performers(
        &self,
        min_samples: usize,
        percentile: f64,
        parameters_version: u32,
    ) -> Result<TopPerformers, PersistenceError> {
        let sample_size = {
            let conn = self.conn()?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM generation_attempts
                 WHERE exclusion_reason IS NULL AND parameters_version = ?1",
                params![parameters_version],
                |r| r.get(0),
            )?;
            count as usize
        };

        if sample_size < min_samples || sample_size == 0 {
            return Ok(TopPerformers {
                sample_size,
                attempts: Vec::new(),
            });
        }

        let take = ((sample_size as f64) * percentile.clamp(0.0, 1.0)).ceil() as usize;
        let take = take.clamp(1, sample_size);
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM generation_attempts
             WHERE exclusion_reason IS NULL AND parameters_version = ?1
             ORDER BY composite_score DESC, created_at DESC, id
             LIMIT ?2"
        );
        let attempts = self.query_many(&sql, params![parameters_version, take as i64])?;
        Ok(TopPerformers {
            sample_size,
            attempts,
        })
    }

    /// Every qualifying attempt, oldest first.
    pub fn query_all_qualifying(&self) -> Result<Vec<GenerationAttempt>, PersistenceError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM generation_attempts
             WHERE exclusion_reason IS NULL
             ORDER BY created_at, id"
        );
        self.query_many(&sql, [])
    }

    /// Recent qualifying attempts for a subject/component pair, newest first.
    pub fn history_for_subject(
        &self,
        subject_key: &str,
        component_type: &str,
        limit: usize,
    ) -> Result<Vec<GenerationAttempt>, PersistenceError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM generation_attempts
             WHERE subject_key = ?1 AND component_type = ?2 AND exclusion_reason IS NULL
             ORDER BY created_at DESC, id
             LIMIT ?3"
        );
        self.query_many(&sql, params![subject_key, component_type, limit as i64])
    }

    /// Number of qualifying attempts.
    pub fn count_qualifying(&self) -> Result<usize, PersistenceError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM generation_attempts WHERE exclusion_reason IS NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// Record a published weight vector.
    pub fn append_weight_vector(&self, vector: &WeightVector) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO weight_vectors (
                version, detection, subjective, readability, confidence, sample_size, last_updated
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                vector.version as i64,
                vector.weights.detection,
                vector.weights.subjective,
                vector.weights.readability,
                vector.confidence.as_str(),
                vector.sample_size as i64,
                format_timestamp(&vector.last_updated),
            ],
        )?;
        Ok(())
    }

    /// The most recently published weight vector.
    pub fn latest_weight_vector(&self) -> Result<Option<WeightVector>, PersistenceError> {
        Ok(self.weight_history(1)?.into_iter().next())
    }

    /// Published weight vectors, newest first.
    pub fn weight_history(&self, limit: usize) -> Result<Vec<WeightVector>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT version, detection, subjective, readability, confidence, sample_size, last_updated
             FROM weight_vectors ORDER BY version DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| {
                Ok(WeightRow {
                    version: r.get(0)?,
                    detection: r.get(1)?,
                    subjective: r.get(2)?,
                    readability: r.get(3)?,
                    confidence: r.get(4)?,
                    sample_size: r.get(5)?,
                    last_updated: r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(WeightVector::try_from).collect()
    }

    /// Read access that includes excluded records. For auditing only; never
    /// feed its results into learning or recommendations.
    pub fn audit(&self) -> AuditView<'_> {
        AuditView { store: self }
    }

    fn query_one<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Option<GenerationAttempt>, PersistenceError> {
        let conn = self.conn()?;
        let row = conn.query_row(sql, params, AttemptRow::from_row).optional()?;
        row.map(GenerationAttempt::try_from).transpose()
    }

    fn query_many<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<GenerationAttempt>, PersistenceError> {
        let conn = self.conn()?;
        select_attempts(&conn, sql, params)
    }
}

// ─── Statements shared by the locked and transactional paths ────────────────

fn insert_attempt_row(
    conn: &Connection,
    attempt: &GenerationAttempt,
    exclusion_reason: Option<&ExclusionReason>,
) -> Result<usize, PersistenceError> {
    let parameters = serde_json::to_string(&attempt.parameters).map_err(corrupt)?;
    let changed = conn.execute(
        "INSERT INTO generation_attempts (
            id, request_id, subject_key, component_type, attempt_number,
            parameters_version, parameters, content, detection_score, detection_method,
            subjective_score, readability_score, composite_score, success,
            exclusion_reason, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT (id) DO NOTHING",
        params![
            attempt.id.to_string(),
            attempt.request_id.to_string(),
            attempt.subject_key,
            attempt.component_type,
            attempt.attempt_number,
            attempt.parameters.version,
            parameters,
            attempt.content,
            attempt.detection_score,
            attempt.detection_method.as_str(),
            attempt.subjective_score,
            attempt.readability_score,
            attempt.composite_score,
            attempt.success,
            exclusion_reason.map(|r| r.as_str().to_string()),
            format_timestamp(&attempt.created_at),
        ],
    )?;
    Ok(changed)
}

fn insert_evaluation_row(
    conn: &Connection,
    evaluation: &SubjectiveEvaluation,
) -> Result<usize, PersistenceError> {
    let tendencies = serde_json::to_string(&evaluation.ai_tendencies).map_err(corrupt)?;
    let changed = conn.execute(
        "INSERT INTO subjective_evaluations (
            attempt_id, narrative, realism_score, voice_authenticity,
            tonal_consistency, ai_tendencies, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (attempt_id) DO NOTHING",
        params![
            evaluation.attempt_id.to_string(),
            evaluation.narrative,
            evaluation.realism_score,
            evaluation.voice_authenticity,
            evaluation.tonal_consistency,
            tendencies,
            format_timestamp(&evaluation.created_at),
        ],
    )?;
    Ok(changed)
}

fn exclude_row(
    conn: &Connection,
    id: Uuid,
    reason: &ExclusionReason,
) -> Result<usize, PersistenceError> {
    let changed = conn.execute(
        "UPDATE generation_attempts SET exclusion_reason = ?2
         WHERE id = ?1 AND exclusion_reason IS NULL",
        params![id.to_string(), reason.as_str()],
    )?;
    Ok(changed)
}

fn select_attempts<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<GenerationAttempt>, PersistenceError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params, AttemptRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(GenerationAttempt::try_from).collect()
}

/// Audit-only read access, including excluded records.
pub struct AuditView<'a> {
    store: &'a ResultStore,
}

impl AuditView<'_> {
    /// An attempt by id regardless of its exclusion status.
    pub fn get_attempt(&self, id: Uuid) -> Result<Option<GenerationAttempt>, PersistenceError> {
        let sql = format!("SELECT {ATTEMPT_COLUMNS} FROM generation_attempts WHERE id = ?1");
        self.store.query_one(&sql, params![id.to_string()])
    }

    /// All attempts, optionally for one subject, oldest first.
    pub fn attempts(
        &self,
        subject_key: Option<&str>,
    ) -> Result<Vec<GenerationAttempt>, PersistenceError> {
        match subject_key {
            Some(subject) => {
                let sql = format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM generation_attempts
                     WHERE subject_key = ?1 ORDER BY created_at, id"
                );
                self.store.query_many(&sql, params![subject])
            }
            None => {
                let sql = format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM generation_attempts ORDER BY created_at, id"
                );
                self.store.query_many(&sql, [])
            }
        }
    }

    /// Only the excluded attempts, oldest first.
    pub fn excluded(&self) -> Result<Vec<GenerationAttempt>, PersistenceError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM generation_attempts
             WHERE exclusion_reason IS NOT NULL ORDER BY created_at, id"
        );
        self.store.query_many(&sql, [])
    }
}

// ─── Row decoding ───────────────────────────────────────────────────────────

struct AttemptRow {
    id: String,
    request_id: String,
    subject_key: String,
    component_type: String,
    attempt_number: u32,
    parameters_version: u32,
    parameters: String,
    content: String,
    detection_score: f64,
    detection_method: String,
    subjective_score: f64,
    readability_score: f64,
    composite_score: f64,
    success: bool,
    exclusion_reason: Option<String>,
    created_at: String,
}

impl AttemptRow {
    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            request_id: r.get(1)?,
            subject_key: r.get(2)?,
            component_type: r.get(3)?,
            attempt_number: r.get(4)?,
            parameters_version: r.get(5)?,
            parameters: r.get(6)?,
            content: r.get(7)?,
            detection_score: r.get(8)?,
            detection_method: r.get(9)?,
            subjective_score: r.get(10)?,
            readability_score: r.get(11)?,
            composite_score: r.get(12)?,
            success: r.get(13)?,
            exclusion_reason: r.get(14)?,
            created_at: r.get(15)?,
        })
    }
}

impl TryFrom<AttemptRow> for GenerationAttempt {
    type Error = PersistenceError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let parameters: GenerationParameters =
            serde_json::from_str(&row.parameters).map_err(corrupt)?;
        if parameters.version != row.parameters_version {
            return Err(PersistenceError::Corrupt {
                message: format!(
                    "attempt {}: parameters version {} does not match column {}",
                    row.id, parameters.version, row.parameters_version
                ),
            });
        }
        let detection_method =
            DetectionMethod::parse(&row.detection_method).ok_or_else(|| {
                PersistenceError::Corrupt {
                    message: format!("unknown detection method '{}'", row.detection_method),
                }
            })?;
        Ok(GenerationAttempt {
            id: parse_uuid(&row.id)?,
            request_id: parse_uuid(&row.request_id)?,
            subject_key: row.subject_key,
            component_type: row.component_type,
            attempt_number: row.attempt_number,
            parameters,
            content: row.content,
            detection_score: row.detection_score,
            detection_method,
            subjective_score: row.subjective_score,
            readability_score: row.readability_score,
            composite_score: row.composite_score,
            success: row.success,
            exclusion_reason: row.exclusion_reason.map(ExclusionReason::from),
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

struct EvaluationRow {
    attempt_id: String,
    narrative: String,
    realism_score: f64,
    voice_authenticity: f64,
    tonal_consistency: f64,
    ai_tendencies: String,
    created_at: String,
}

impl TryFrom<EvaluationRow> for SubjectiveEvaluation {
    type Error = PersistenceError;

    fn try_from(row: EvaluationRow) -> Result<Self, Self::Error> {
        let ai_tendencies: BTreeSet<String> =
            serde_json::from_str(&row.ai_tendencies).map_err(corrupt)?;
        Ok(SubjectiveEvaluation {
            attempt_id: parse_uuid(&row.attempt_id)?,
            narrative: row.narrative,
            realism_score: row.realism_score,
            voice_authenticity: row.voice_authenticity,
            tonal_consistency: row.tonal_consistency,
            ai_tendencies,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

struct WeightRow {
    version: i64,
    detection: f64,
    subjective: f64,
    readability: f64,
    confidence: String,
    sample_size: i64,
    last_updated: String,
}

impl TryFrom<WeightRow> for WeightVector {
    type Error = PersistenceError;

    fn try_from(row: WeightRow) -> Result<Self, Self::Error> {
        let weights = Weights::new(row.detection, row.subjective, row.readability).map_err(|e| {
            PersistenceError::Corrupt {
                message: format!("weight vector v{}: {e}", row.version),
            }
        })?;
        let confidence =
            Confidence::parse(&row.confidence).ok_or_else(|| PersistenceError::Corrupt {
                message: format!("unknown confidence '{}'", row.confidence),
            })?;
        Ok(WeightVector {
            version: row.version as u64,
            weights,
            confidence,
            sample_size: row.sample_size as usize,
            last_updated: parse_timestamp(&row.last_updated)?,
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Corrupt {
            message: format!("bad timestamp '{value}': {e}"),
        })
}

fn parse_uuid(value: &str) -> Result<Uuid, PersistenceError> {
    Uuid::parse_str(value).map_err(|e| PersistenceError::Corrupt {
        message: format!("bad id '{value}': {e}"),
    })
}

fn corrupt(e: serde_json::Error) -> PersistenceError {
    PersistenceError::Corrupt {
        message: e.to_string(),
    }
}
