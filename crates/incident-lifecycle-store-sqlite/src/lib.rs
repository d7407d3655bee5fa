#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use incident_lifecycle_core::{
    apply_assignment, apply_transition, build_evidence, can_view, format_rfc3339,
    now_utc, parse_rfc3339_utc, Actor, Crew, CrewId, CrewTarget, Department, DepartmentId,
    Evidence, EvidenceId, EvidenceInput, GeoPoint, Incident, IncidentContext, IncidentId,
    IncidentStatus, IncidentType, IncidentTypeId, LifecycleConfig, LifecycleError, MediaKind,
    NewIncident, NotificationIntent, PrincipalId, Priority, ReporterContact, StatusEdge, SurveyId,
    TransitionContext, TransitionRequest,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

const LIFECYCLE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LIFECYCLE_V1: &str = r"
CREATE TABLE IF NOT EXISTS lifecycle_config (
  config_version INTEGER PRIMARY KEY CHECK (config_version >= 1),
  config_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS departments (
  department_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  responsible TEXT,
  contact_email TEXT,
  active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crews (
  crew_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  department_id TEXT NOT NULL,
  lead TEXT,
  member TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (department_id) REFERENCES departments(department_id)
);

CREATE INDEX IF NOT EXISTS idx_crews_department ON crews(department_id, name);

CREATE TABLE IF NOT EXISTS incident_types (
  incident_type_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE COLLATE NOCASE,
  description TEXT NOT NULL,
  severity TEXT NOT NULL CHECK (severity IN ('high', 'medium', 'low')),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS incidents (
  incident_id TEXT PRIMARY KEY,
  title TEXT NOT NULL UNIQUE COLLATE NOCASE,
  description TEXT NOT NULL,
  status TEXT NOT NULL CHECK (
    status IN ('pending', 'in_progress', 'completed', 'validated', 'rejected')
  ),
  priority TEXT NOT NULL CHECK (priority IN ('high', 'medium', 'low')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  closed_at TEXT,
  latitude REAL NOT NULL CHECK (latitude BETWEEN -90.0 AND 90.0),
  longitude REAL NOT NULL CHECK (longitude BETWEEN -180.0 AND 180.0),
  reporter_name TEXT NOT NULL,
  reporter_email TEXT NOT NULL,
  reporter_phone TEXT NOT NULL,
  rejection_reason TEXT,
  department_id TEXT,
  crew_id TEXT,
  incident_type_id TEXT,
  survey_id TEXT,
  version INTEGER NOT NULL CHECK (version >= 1),
  FOREIGN KEY (department_id) REFERENCES departments(department_id),
  FOREIGN KEY (crew_id) REFERENCES crews(crew_id),
  FOREIGN KEY (incident_type_id) REFERENCES incident_types(incident_type_id)
);

CREATE INDEX IF NOT EXISTS idx_incidents_status_created
  ON incidents(status, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_incidents_crew ON incidents(crew_id);

CREATE TABLE IF NOT EXISTS evidence (
  evidence_id TEXT PRIMARY KEY,
  incident_id TEXT NOT NULL,
  name TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('image', 'video', 'audio', 'document')),
  format TEXT NOT NULL,
  size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
  storage_ref TEXT NOT NULL,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  survey_id TEXT,
  FOREIGN KEY (incident_id) REFERENCES incidents(incident_id)
);

CREATE INDEX IF NOT EXISTS idx_evidence_incident ON evidence(incident_id, created_at);

CREATE TRIGGER IF NOT EXISTS trg_evidence_no_update
BEFORE UPDATE ON evidence
BEGIN
  SELECT RAISE(FAIL, 'evidence is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_evidence_no_delete
BEFORE DELETE ON evidence
BEGIN
  SELECT RAISE(FAIL, 'evidence is append-only');
END;

CREATE TABLE IF NOT EXISTS status_transitions (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  incident_id TEXT NOT NULL,
  from_status TEXT NOT NULL CHECK (
    from_status IN ('pending', 'in_progress', 'completed', 'validated', 'rejected')
  ),
  to_status TEXT NOT NULL CHECK (
    to_status IN ('pending', 'in_progress', 'completed', 'validated', 'rejected')
  ),
  actor_id TEXT NOT NULL,
  reason TEXT,
  version INTEGER NOT NULL CHECK (version >= 1),
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (incident_id) REFERENCES incidents(incident_id)
);

CREATE INDEX IF NOT EXISTS idx_status_transitions_incident
  ON status_transitions(incident_id, seq);

CREATE TRIGGER IF NOT EXISTS trg_status_transitions_no_update
BEFORE UPDATE ON status_transitions
BEGIN
  SELECT RAISE(FAIL, 'status_transitions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_status_transitions_no_delete
BEFORE DELETE ON status_transitions
BEGIN
  SELECT RAISE(FAIL, 'status_transitions is append-only');
END;

CREATE TABLE IF NOT EXISTS crew_dispatches (
  dispatch_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  incident_id TEXT NOT NULL,
  crew_id TEXT NOT NULL,
  dispatched_at TEXT NOT NULL,
  finished_at TEXT,
  FOREIGN KEY (incident_id) REFERENCES incidents(incident_id),
  FOREIGN KEY (crew_id) REFERENCES crews(crew_id)
);

CREATE INDEX IF NOT EXISTS idx_crew_dispatches_open
  ON crew_dispatches(incident_id, finished_at);
";

const INCIDENT_COLUMNS: &str = "incident_id, title, description, status, priority,
    created_at, updated_at, closed_at, latitude, longitude,
    reporter_name, reporter_email, reporter_phone, rejection_reason,
    department_id, crew_id, incident_type_id, survey_id, version";

pub struct SqliteIncidentStore {
    conn: Connection,
}

/// Listing filters; every field narrows the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncidentFilter {
    pub title: Option<String>,
    pub status: Option<IncidentStatus>,
    pub department_id: Option<DepartmentId>,
    pub incident_type_id: Option<IncidentTypeId>,
    pub limit: Option<usize>,
}

/// Result of a committed (or no-op) transition request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionReceipt {
    pub incident: Incident,
    pub notification: Option<NotificationIntent>,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusTransitionRecord {
    pub seq: i64,
    pub incident_id: IncidentId,
    pub from_status: IncidentStatus,
    pub to_status: IncidentStatus,
    pub actor_id: PrincipalId,
    pub reason: Option<String>,
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrewDispatch {
    pub dispatch_seq: i64,
    pub incident_id: IncidentId,
    pub crew_id: CrewId,
    #[serde(with = "time::serde::rfc3339")]
    pub dispatched_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IntegrityIssueSeverity,
    pub incident_id: Option<IncidentId>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub contract_version: String,
    pub healthy: bool,
    pub incidents_checked: usize,
    pub issues: Vec<IntegrityIssue>,
}

/// Recovers the domain error carried inside an `anyhow` chain.
#[must_use]
pub fn lifecycle_error(err: &anyhow::Error) -> Option<&LifecycleError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<LifecycleError>())
}

impl SqliteIncidentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LIFECYCLE_V1)
            .context("failed to apply lifecycle schema")?;

        let now = format_rfc3339(now_utc())?;
        let registered = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LIFECYCLE_MIGRATION_VERSION, now],
            )
            .context("failed to register lifecycle schema migration")?;

        let seeded = self
            .conn
            .query_row("SELECT COUNT(*) FROM lifecycle_config", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to count lifecycle_config rows")?;
        if seeded == 0 {
            self.upsert_config(&LifecycleConfig::v1())?;
        }

        if registered > 0 {
            info!(
                version = LIFECYCLE_MIGRATION_VERSION,
                "applied lifecycle schema migration"
            );
        }
        Ok(())
    }

    pub fn upsert_config(&self, config: &LifecycleConfig) -> Result<()> {
        config.validate()?;

        let payload = serde_json::to_string(config).context("failed to serialize config")?;
        let now = format_rfc3339(now_utc())?;

        self.conn
            .execute(
                "INSERT INTO lifecycle_config(config_version, config_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(config_version) DO UPDATE SET
                   config_json = excluded.config_json,
                   updated_at = excluded.updated_at",
                params![i64::from(config.config_version), payload, now],
            )
            .context("failed to upsert lifecycle config")?;

        info!(
            config_version = config.config_version,
            "lifecycle config stored"
        );
        Ok(())
    }

    /// Returns the highest-versioned stored config.
    pub fn get_config(&self) -> Result<LifecycleConfig> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT config_json FROM lifecycle_config ORDER BY config_version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read lifecycle config")?;

        let Some(json) = json else {
            return Err(LifecycleError::Configuration(
                "lifecycle config missing; run migrate first".to_string(),
            )
            .into());
        };
        let value: Value = serde_json::from_str(&json).context("invalid stored config JSON")?;
        Ok(LifecycleConfig::from_json(&value)?)
    }

    pub fn insert_department(&self, department: &Department) -> Result<()> {
        department.validate()?;
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO departments(department_id, name, responsible, contact_email, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    department.id.to_string(),
                    department.name.trim(),
                    department.responsible.as_ref().map(PrincipalId::as_str),
                    department.contact_email,
                    bool_to_sql(department.active),
                    now,
                ],
            )
            .context("failed to insert department")?;
        info!(department_id = %department.id, name = %department.name, "department registered");
        Ok(())
    }

    pub fn get_department(&self, department_id: DepartmentId) -> Result<Option<Department>> {
        load_department(&self.conn, department_id)
    }

    pub fn list_departments(&self) -> Result<Vec<Department>> {
        let mut stmt = self.conn.prepare(
            "SELECT department_id, name, responsible, contact_email, active
             FROM departments ORDER BY name ASC, department_id ASC",
        )?;
        let rows = stmt.query_map([], parse_department_row)?;
        collect_rows(rows)
    }

    pub fn insert_crew(&self, crew: &Crew) -> Result<()> {
        crew.validate()?;
        if load_department(&self.conn, crew.department_id)?.is_none() {
            return Err(LifecycleError::Validation(format!(
                "unknown department {} for crew {}",
                crew.department_id, crew.name
            ))
            .into());
        }
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO crews(crew_id, name, department_id, lead, member, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    crew.id.to_string(),
                    crew.name.trim(),
                    crew.department_id.to_string(),
                    crew.lead.as_ref().map(PrincipalId::as_str),
                    crew.member.as_str(),
                    now,
                ],
            )
            .context("failed to insert crew")?;
        info!(crew_id = %crew.id, department_id = %crew.department_id, "crew registered");
        Ok(())
    }

    pub fn get_crew(&self, crew_id: CrewId) -> Result<Option<Crew>> {
        load_crew(&self.conn, crew_id)
    }

    /// Lists crews, optionally only those owned by `department_id`.
    pub fn list_crews(&self, department_id: Option<DepartmentId>) -> Result<Vec<Crew>> {
        let mut stmt = self.conn.prepare(
            "SELECT crew_id, name, department_id, lead, member
             FROM crews
             WHERE (?1 IS NULL OR department_id = ?1)
             ORDER BY name ASC, crew_id ASC",
        )?;
        let rows = stmt.query_map(
            params![department_id.map(|id| id.to_string())],
            parse_crew_row,
        )?;
        collect_rows(rows)
    }

    pub fn insert_incident_type(&self, incident_type: &IncidentType) -> Result<()> {
        incident_type.validate()?;
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO incident_types(incident_type_id, name, description, severity, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    incident_type.id.to_string(),
                    incident_type.name.trim(),
                    incident_type.description,
                    incident_type.severity.as_str(),
                    now,
                ],
            )
            .context("failed to insert incident type")?;
        info!(incident_type_id = %incident_type.id, "incident type registered");
        Ok(())
    }

    pub fn get_incident_type(&self, incident_type_id: IncidentTypeId) -> Result<Option<IncidentType>> {
        load_incident_type(&self.conn, incident_type_id)
    }

    pub fn list_incident_types(&self) -> Result<Vec<IncidentType>> {
        let mut stmt = self.conn.prepare(
            "SELECT incident_type_id, name, description, severity
             FROM incident_types ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], parse_incident_type_row)?;
        collect_rows(rows)
    }

    /// Records a new `Pending` incident.
    pub fn create_incident(&mut self, input: NewIncident) -> Result<Incident> {
        input.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start incident transaction")?;

        if let Some(department_id) = input.department_id {
            if load_department(&tx, department_id)?.is_none() {
                return Err(LifecycleError::Validation(format!(
                    "unknown department {department_id}"
                ))
                .into());
            }
        }
        let severity = match input.incident_type_id {
            Some(type_id) => Some(
                load_incident_type(&tx, type_id)?
                    .ok_or_else(|| {
                        LifecycleError::Validation(format!("unknown incident type {type_id}"))
                    })?
                    .severity,
            ),
            None => None,
        };
        ensure_title_available(&tx, &input.title, None)?;

        let incident = input.into_incident(IncidentId::new(), severity, now_utc());
        insert_incident(&tx, &incident)?;
        tx.commit()
            .context("failed to commit incident transaction")?;

        info!(
            incident_id = %incident.id,
            priority = incident.priority.as_str(),
            "incident created"
        );
        Ok(incident)
    }

    pub fn get_incident(&self, incident_id: IncidentId) -> Result<Option<Incident>> {
        load_incident(&self.conn, incident_id)
    }

    /// Lists incidents visible to `actor`, newest first.
    pub fn list_incidents(&self, actor: &Actor, filter: &IncidentFilter) -> Result<Vec<Incident>> {
        let title_pattern = filter
            .title
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| format!("%{}%", value.to_lowercase()));

        let query = format!(
            "SELECT {INCIDENT_COLUMNS}
             FROM incidents
             WHERE (?1 IS NULL OR lower(title) LIKE ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR department_id = ?3)
               AND (?4 IS NULL OR incident_type_id = ?4)
             ORDER BY created_at DESC, incident_id DESC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![
                title_pattern,
                filter.status.map(IncidentStatus::as_str),
                filter.department_id.map(|id| id.to_string()),
                filter.incident_type_id.map(|id| id.to_string()),
            ],
            parse_incident_row,
        )?;
        let candidates = collect_rows(rows)?;

        let crews: BTreeMap<CrewId, Crew> = self
            .list_crews(None)?
            .into_iter()
            .map(|crew| (crew.id, crew))
            .collect();

        let visible = candidates.into_iter().filter(|incident| {
            let crew = incident.crew_id.and_then(|id| crews.get(&id));
            can_view(actor, incident, crew)
        });
        Ok(match filter.limit {
            Some(limit) => visible.take(limit).collect(),
            None => visible.collect(),
        })
    }

    /// Validates and applies a transition under the write lock.
    ///
    /// Callers pass the version they loaded. A mismatch, or a row that moved
    /// before the conditional update, fails with [`LifecycleError::StaleState`].
    pub fn apply_transition(
        &mut self,
        incident_id: IncidentId,
        actor: &Actor,
        expected_version: u64,
        request: &TransitionRequest,
    ) -> Result<TransitionReceipt> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transition transaction")?;

        let incident = require_incident(&tx, incident_id)?;
        check_expected_version(expected_version, incident.version)?;

        let department = match incident.department_id {
            Some(id) => load_department(&tx, id)?,
            None => None,
        };
        let crew = match incident.crew_id {
            Some(id) => load_crew(&tx, id)?,
            None => None,
        };
        // An unknown crew stays unresolved; the state machine decides whether
        // the actor gets to hear about it.
        let requested = match request.fields.crew_id {
            Some(crew_id) => load_crew_with_department(&tx, crew_id)?,
            None => None,
        };
        let requested_crew = match &requested {
            Some((crew, department)) => Some(CrewTarget::new(crew, department)?),
            None => None,
        };
        let ctx = TransitionContext {
            department: department.as_ref(),
            crew: crew.as_ref(),
            requested_crew,
            evidence_count: count_evidence(&tx, incident_id)?,
        };

        let now = now_utc();
        let outcome = match apply_transition(&incident, actor, request, &ctx, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(
                    incident_id = %incident_id,
                    actor = %actor.principal_id,
                    to = %request.to,
                    code = err.code(),
                    "transition rejected"
                );
                return Err(err.into());
            }
        };

        if outcome.changed {
            if outcome.incident.title != incident.title {
                ensure_title_available(&tx, &outcome.incident.title, Some(incident_id))?;
            }
            update_incident(&tx, &outcome.incident, incident.version)?;

            if let Some(crew_id) = outcome.assigned_crew {
                open_dispatch(&tx, incident_id, crew_id, now)?;
            }
            if let Some(edge) = outcome.edge {
                record_transition(&tx, &outcome.incident, edge, actor, now)?;
                if matches!(
                    edge.to,
                    IncidentStatus::Completed | IncidentStatus::Rejected
                ) {
                    close_open_dispatches(&tx, incident_id, now)?;
                }
            }
        }
        tx.commit()
            .context("failed to commit transition transaction")?;

        match outcome.edge {
            Some(edge) => info!(
                incident_id = %incident_id,
                actor = %actor.principal_id,
                from = %edge.from,
                to = %edge.to,
                version = outcome.incident.version,
                "incident transition committed"
            ),
            None if outcome.changed => info!(
                incident_id = %incident_id,
                actor = %actor.principal_id,
                version = outcome.incident.version,
                "incident fields updated"
            ),
            None => debug!(incident_id = %incident_id, "same-state request changed nothing"),
        }

        Ok(TransitionReceipt {
            incident: outcome.incident,
            notification: outcome.notification,
            changed: outcome.changed,
        })
    }

    /// Points the incident at a crew outside of a status change.
    pub fn assign_crew(
        &mut self,
        incident_id: IncidentId,
        crew_id: CrewId,
        actor: &Actor,
        expected_version: Option<u64>,
    ) -> Result<Incident> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start assignment transaction")?;

        let incident = require_incident(&tx, incident_id)?;
        if let Some(expected) = expected_version {
            check_expected_version(expected, incident.version)?;
        }

        let department = match incident.department_id {
            Some(id) => load_department(&tx, id)?,
            None => None,
        };
        let (crew, crew_department) = require_crew_with_department(&tx, crew_id)?;
        let target = CrewTarget::new(&crew, &crew_department)?;
        let ctx = IncidentContext::new(&incident).with_department(department.as_ref());

        let now = now_utc();
        let next = match apply_assignment(actor, &ctx, &target, now) {
            Ok(next) => next,
            Err(err) => {
                debug!(
                    incident_id = %incident_id,
                    crew_id = %crew_id,
                    code = err.code(),
                    "crew assignment rejected"
                );
                return Err(err.into());
            }
        };

        update_incident(&tx, &next, incident.version)?;
        if incident.crew_id != Some(crew_id) {
            open_dispatch(&tx, incident_id, crew_id, now)?;
        }
        tx.commit()
            .context("failed to commit assignment transaction")?;

        info!(
            incident_id = %incident_id,
            crew_id = %crew_id,
            actor = %actor.principal_id,
            version = next.version,
            "crew assigned"
        );
        Ok(next)
    }

    pub fn attach_evidence(
        &mut self,
        incident_id: IncidentId,
        actor: &Actor,
        input: EvidenceInput,
    ) -> Result<Evidence> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start evidence transaction")?;

        let incident = require_incident(&tx, incident_id)?;
        let department = match incident.department_id {
            Some(id) => load_department(&tx, id)?,
            None => None,
        };
        let crew = match incident.crew_id {
            Some(id) => load_crew(&tx, id)?,
            None => None,
        };
        let ctx = IncidentContext::new(&incident)
            .with_department(department.as_ref())
            .with_crew(crew.as_ref());

        let evidence = match build_evidence(actor, &ctx, input, now_utc()) {
            Ok(evidence) => evidence,
            Err(err) => {
                debug!(
                    incident_id = %incident_id,
                    actor = %actor.principal_id,
                    code = err.code(),
                    "evidence rejected"
                );
                return Err(err.into());
            }
        };

        tx.execute(
            "INSERT INTO evidence(
                evidence_id, incident_id, name, kind, format, size_bytes,
                storage_ref, created_by, created_at, survey_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                evidence.id.to_string(),
                evidence.incident_id.to_string(),
                evidence.name,
                evidence.kind.as_str(),
                evidence.format,
                u64_to_sql(evidence.size_bytes, "size_bytes")?,
                evidence.storage_ref,
                evidence.created_by.as_str(),
                format_rfc3339(evidence.created_at)?,
                evidence.survey_id.map(|id| id.to_string()),
            ],
        )
        .context("failed to insert evidence")?;
        tx.commit()
            .context("failed to commit evidence transaction")?;

        info!(
            incident_id = %incident_id,
            evidence_id = %evidence.id,
            kind = evidence.kind.as_str(),
            "evidence attached"
        );
        Ok(evidence)
    }

    pub fn list_evidence(&self, incident_id: IncidentId) -> Result<Vec<Evidence>> {
        let mut stmt = self.conn.prepare(
            "SELECT evidence_id, incident_id, name, kind, format, size_bytes,
                    storage_ref, created_by, created_at, survey_id
             FROM evidence
             WHERE incident_id = ?1
             ORDER BY created_at ASC, evidence_id ASC",
        )?;
        let rows = stmt.query_map(params![incident_id.to_string()], parse_evidence_row)?;
        collect_rows(rows)
    }

    pub fn list_transitions(&self, incident_id: IncidentId) -> Result<Vec<StatusTransitionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, incident_id, from_status, to_status, actor_id, reason, version, recorded_at
             FROM status_transitions
             WHERE incident_id = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![incident_id.to_string()], parse_transition_row)?;
        collect_rows(rows)
    }

    pub fn list_dispatches(&self, incident_id: IncidentId) -> Result<Vec<CrewDispatch>> {
        let mut stmt = self.conn.prepare(
            "SELECT dispatch_seq, incident_id, crew_id, dispatched_at, finished_at
             FROM crew_dispatches
             WHERE incident_id = ?1
             ORDER BY dispatch_seq ASC",
        )?;
        let rows = stmt.query_map(params![incident_id.to_string()], parse_dispatch_row)?;
        collect_rows(rows)
    }

    /// Scans persisted incidents for violated record invariants.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let query = format!("SELECT {INCIDENT_COLUMNS} FROM incidents ORDER BY created_at ASC");
        let mut stmt = self.conn.prepare(&query)?;
        let incidents = collect_rows(stmt.query_map([], parse_incident_row)?)?;

        let crews: BTreeMap<CrewId, Crew> = self
            .list_crews(None)?
            .into_iter()
            .map(|crew| (crew.id, crew))
            .collect();
        let departments: BTreeMap<DepartmentId, Department> = self
            .list_departments()?
            .into_iter()
            .map(|department| (department.id, department))
            .collect();

        let mut issues = Vec::new();
        for incident in &incidents {
            let id = incident.id;
            let has_reason = incident
                .rejection_reason
                .as_deref()
                .is_some_and(|reason| !reason.trim().is_empty());
            if has_reason != (incident.status == IncidentStatus::Rejected) {
                issues.push(error_issue(
                    "rejection_reason_mismatch",
                    id,
                    format!(
                        "status {} with rejection_reason present={has_reason}",
                        incident.status
                    ),
                ));
            }

            if incident.closed_at.is_some() != (incident.status == IncidentStatus::Validated) {
                issues.push(error_issue(
                    "closed_at_mismatch",
                    id,
                    format!(
                        "status {} with closed_at present={}",
                        incident.status,
                        incident.closed_at.is_some()
                    ),
                ));
            }

            if let Some(crew_id) = incident.crew_id {
                match (incident.department_id, crews.get(&crew_id)) {
                    (None, _) => issues.push(error_issue(
                        "crew_without_department",
                        id,
                        format!("crew {crew_id} assigned without a department"),
                    )),
                    (Some(department_id), Some(crew)) if crew.department_id != department_id => {
                        issues.push(error_issue(
                            "crew_department_mismatch",
                            id,
                            format!(
                                "crew {crew_id} belongs to {} but incident is in {department_id}",
                                crew.department_id
                            ),
                        ));
                    }
                    _ => {}
                }
            }

            if matches!(
                incident.status,
                IncidentStatus::Completed | IncidentStatus::Validated
            ) && count_evidence(&self.conn, id)? == 0
            {
                issues.push(error_issue(
                    "completed_without_evidence",
                    id,
                    format!("incident is {} with no evidence attached", incident.status),
                ));
            }

            let open = !incident.status.is_terminal();
            if let Some(department) = incident
                .department_id
                .and_then(|department_id| departments.get(&department_id))
            {
                if open && !department.active {
                    issues.push(IntegrityIssue {
                        code: "inactive_department".to_string(),
                        severity: IntegrityIssueSeverity::Warning,
                        incident_id: Some(id),
                        message: format!(
                            "open incident routed to inactive department {}",
                            department.name
                        ),
                    });
                }
            }
        }

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == IntegrityIssueSeverity::Error);

        Ok(IntegrityReport {
            contract_version: "integrity_check.v1".to_string(),
            healthy,
            incidents_checked: incidents.len(),
            issues,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn error_issue(code: &str, incident_id: IncidentId, message: String) -> IntegrityIssue {
    IntegrityIssue {
        code: code.to_string(),
        severity: IntegrityIssueSeverity::Error,
        incident_id: Some(incident_id),
        message,
    }
}

fn check_expected_version(expected: u64, found: u64) -> Result<(), LifecycleError> {
    if expected == found {
        Ok(())
    } else {
        Err(LifecycleError::StaleState { expected, found })
    }
}

fn require_incident(conn: &Connection, incident_id: IncidentId) -> Result<Incident> {
    load_incident(conn, incident_id)?.ok_or_else(|| {
        LifecycleError::Validation(format!("incident {incident_id} not found")).into()
    })
}

fn load_crew_with_department(
    conn: &Connection,
    crew_id: CrewId,
) -> Result<Option<(Crew, Department)>> {
    let Some(crew) = load_crew(conn, crew_id)? else {
        return Ok(None);
    };
    let department = load_department(conn, crew.department_id)?.ok_or_else(|| {
        anyhow!(
            "crew {crew_id} references missing department {}",
            crew.department_id
        )
    })?;
    Ok(Some((crew, department)))
}

fn require_crew_with_department(conn: &Connection, crew_id: CrewId) -> Result<(Crew, Department)> {
    load_crew_with_department(conn, crew_id)?
        .ok_or_else(|| LifecycleError::Validation(format!("crew {crew_id} not found")).into())
}

fn ensure_title_available(
    conn: &Connection,
    title: &str,
    exclude: Option<IncidentId>,
) -> Result<()> {
    let taken: Option<String> = conn
        .query_row(
            "SELECT incident_id FROM incidents
             WHERE title = ?1 COLLATE NOCASE AND (?2 IS NULL OR incident_id <> ?2)
             LIMIT 1",
            params![title.trim(), exclude.map(|id| id.to_string())],
            |row| row.get(0),
        )
        .optional()
        .context("failed to check incident title uniqueness")?;
    if taken.is_some() {
        return Err(LifecycleError::Validation(format!(
            "an incident titled '{}' already exists",
            title.trim()
        ))
        .into());
    }
    Ok(())
}

fn load_incident(conn: &Connection, incident_id: IncidentId) -> Result<Option<Incident>> {
    let query = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE incident_id = ?1");
    conn.query_row(&query, params![incident_id.to_string()], parse_incident_row)
        .optional()
        .with_context(|| format!("failed to load incident {incident_id}"))
}

fn load_department(conn: &Connection, department_id: DepartmentId) -> Result<Option<Department>> {
    conn.query_row(
        "SELECT department_id, name, responsible, contact_email, active
         FROM departments WHERE department_id = ?1",
        params![department_id.to_string()],
        parse_department_row,
    )
    .optional()
    .with_context(|| format!("failed to load department {department_id}"))
}

fn load_crew(conn: &Connection, crew_id: CrewId) -> Result<Option<Crew>> {
    conn.query_row(
        "SELECT crew_id, name, department_id, lead, member FROM crews WHERE crew_id = ?1",
        params![crew_id.to_string()],
        parse_crew_row,
    )
    .optional()
    .with_context(|| format!("failed to load crew {crew_id}"))
}

fn load_incident_type(
    conn: &Connection,
    incident_type_id: IncidentTypeId,
) -> Result<Option<IncidentType>> {
    conn.query_row(
        "SELECT incident_type_id, name, description, severity
         FROM incident_types WHERE incident_type_id = ?1",
        params![incident_type_id.to_string()],
        parse_incident_type_row,
    )
    .optional()
    .with_context(|| format!("failed to load incident type {incident_type_id}"))
}

fn count_evidence(conn: &Connection, incident_id: IncidentId) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM evidence WHERE incident_id = ?1",
            params![incident_id.to_string()],
            |row| row.get(0),
        )
        .context("failed to count evidence")?;
    u64::try_from(count).with_context(|| format!("invalid evidence count: {count}"))
}

fn insert_incident(conn: &Connection, incident: &Incident) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO incidents({INCIDENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        ),
        params![
            incident.id.to_string(),
            incident.title,
            incident.description,
            incident.status.as_str(),
            incident.priority.as_str(),
            format_rfc3339(incident.created_at)?,
            format_rfc3339(incident.updated_at)?,
            incident.closed_at.map(format_rfc3339).transpose()?,
            incident.location.latitude,
            incident.location.longitude,
            incident.reporter.name,
            incident.reporter.email,
            incident.reporter.phone,
            incident.rejection_reason,
            incident.department_id.map(|id| id.to_string()),
            incident.crew_id.map(|id| id.to_string()),
            incident.incident_type_id.map(|id| id.to_string()),
            incident.survey_id.map(|id| id.to_string()),
            u64_to_sql(incident.version, "version")?,
        ],
    )
    .context("failed to insert incident")?;
    Ok(())
}

/// Writes `incident` only if the stored row still carries `previous_version`.
fn update_incident(conn: &Connection, incident: &Incident, previous_version: u64) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE incidents SET
                title = ?2, description = ?3, status = ?4, priority = ?5,
                updated_at = ?6, closed_at = ?7, rejection_reason = ?8,
                department_id = ?9, crew_id = ?10, version = ?11
             WHERE incident_id = ?1 AND version = ?12",
            params![
                incident.id.to_string(),
                incident.title,
                incident.description,
                incident.status.as_str(),
                incident.priority.as_str(),
                format_rfc3339(incident.updated_at)?,
                incident.closed_at.map(format_rfc3339).transpose()?,
                incident.rejection_reason,
                incident.department_id.map(|id| id.to_string()),
                incident.crew_id.map(|id| id.to_string()),
                u64_to_sql(incident.version, "version")?,
                u64_to_sql(previous_version, "version")?,
            ],
        )
        .with_context(|| format!("failed to update incident {}", incident.id))?;

    if updated == 0 {
        let found = load_incident(conn, incident.id)?.map_or(0, |current| current.version);
        return Err(LifecycleError::StaleState {
            expected: previous_version,
            found,
        }
        .into());
    }
    Ok(())
}

fn record_transition(
    conn: &Connection,
    incident: &Incident,
    edge: StatusEdge,
    actor: &Actor,
    now: OffsetDateTime,
) -> Result<()> {
    let reason = if edge.to == IncidentStatus::Rejected {
        incident.rejection_reason.clone()
    } else {
        None
    };
    conn.execute(
        "INSERT INTO status_transitions(
            incident_id, from_status, to_status, actor_id, reason, version, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            incident.id.to_string(),
            edge.from.as_str(),
            edge.to.as_str(),
            actor.principal_id.as_str(),
            reason,
            u64_to_sql(incident.version, "version")?,
            format_rfc3339(now)?,
        ],
    )
    .context("failed to record status transition")?;
    Ok(())
}

fn close_open_dispatches(conn: &Connection, incident_id: IncidentId, now: OffsetDateTime) -> Result<()> {
    conn.execute(
        "UPDATE crew_dispatches SET finished_at = ?2
         WHERE incident_id = ?1 AND finished_at IS NULL",
        params![incident_id.to_string(), format_rfc3339(now)?],
    )
    .context("failed to close crew dispatch")?;
    Ok(())
}

fn open_dispatch(
    conn: &Connection,
    incident_id: IncidentId,
    crew_id: CrewId,
    now: OffsetDateTime,
) -> Result<()> {
    close_open_dispatches(conn, incident_id, now)?;
    conn.execute(
        "INSERT INTO crew_dispatches(incident_id, crew_id, dispatched_at) VALUES (?1, ?2, ?3)",
        params![
            incident_id.to_string(),
            crew_id.to_string(),
            format_rfc3339(now)?
        ],
    )
    .context("failed to open crew dispatch")?;
    Ok(())
}

fn parse_incident_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
    let status_raw: String = row.get(3)?;
    let priority_raw: String = row.get(4)?;

    let status = IncidentStatus::parse(&status_raw)
        .ok_or_else(|| conversion_error(3, format!("invalid status: {status_raw}")))?;
    let priority = Priority::parse(&priority_raw)
        .ok_or_else(|| conversion_error(4, format!("invalid priority: {priority_raw}")))?;

    let closed_at = row
        .get::<_, Option<String>>(7)?
        .map(|raw| parse_rfc3339_utc(&raw).map_err(|err| conversion_error(7, err.to_string())))
        .transpose()?;

    Ok(Incident {
        id: IncidentId(column_ulid(row, 0)?),
        title: row.get(1)?,
        description: row.get(2)?,
        status,
        priority,
        created_at: column_timestamp(row, 5)?,
        updated_at: column_timestamp(row, 6)?,
        closed_at,
        location: GeoPoint {
            latitude: row.get(8)?,
            longitude: row.get(9)?,
        },
        reporter: ReporterContact {
            name: row.get(10)?,
            email: row.get(11)?,
            phone: row.get(12)?,
        },
        rejection_reason: row.get(13)?,
        department_id: column_optional_ulid(row, 14)?.map(DepartmentId),
        crew_id: column_optional_ulid(row, 15)?.map(CrewId),
        incident_type_id: column_optional_ulid(row, 16)?.map(IncidentTypeId),
        survey_id: column_optional_ulid(row, 17)?.map(SurveyId),
        version: column_u64(row, 18)?,
    })
}

fn parse_department_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Department> {
    Ok(Department {
        id: DepartmentId(column_ulid(row, 0)?),
        name: row.get(1)?,
        responsible: column_optional_principal(row, 2)?,
        contact_email: row.get(3)?,
        active: row.get::<_, i64>(4)? == 1,
    })
}

fn parse_crew_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Crew> {
    Ok(Crew {
        id: CrewId(column_ulid(row, 0)?),
        name: row.get(1)?,
        department_id: DepartmentId(column_ulid(row, 2)?),
        lead: column_optional_principal(row, 3)?,
        member: column_principal(row, 4)?,
    })
}

fn parse_incident_type_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IncidentType> {
    let severity_raw: String = row.get(3)?;
    let severity = Priority::parse(&severity_raw)
        .ok_or_else(|| conversion_error(3, format!("invalid severity: {severity_raw}")))?;
    Ok(IncidentType {
        id: IncidentTypeId(column_ulid(row, 0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        severity,
    })
}

fn parse_evidence_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Evidence> {
    let kind_raw: String = row.get(3)?;
    let kind = MediaKind::parse(&kind_raw)
        .ok_or_else(|| conversion_error(3, format!("invalid evidence kind: {kind_raw}")))?;
    Ok(Evidence {
        id: EvidenceId(column_ulid(row, 0)?),
        incident_id: IncidentId(column_ulid(row, 1)?),
        name: row.get(2)?,
        kind,
        format: row.get(4)?,
        size_bytes: column_u64(row, 5)?,
        storage_ref: row.get(6)?,
        created_by: column_principal(row, 7)?,
        created_at: column_timestamp(row, 8)?,
        survey_id: column_optional_ulid(row, 9)?.map(SurveyId),
    })
}

fn parse_transition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StatusTransitionRecord> {
    let from_raw: String = row.get(2)?;
    let to_raw: String = row.get(3)?;
    Ok(StatusTransitionRecord {
        seq: row.get(0)?,
        incident_id: IncidentId(column_ulid(row, 1)?),
        from_status: IncidentStatus::parse(&from_raw)
            .ok_or_else(|| conversion_error(2, format!("invalid from_status: {from_raw}")))?,
        to_status: IncidentStatus::parse(&to_raw)
            .ok_or_else(|| conversion_error(3, format!("invalid to_status: {to_raw}")))?,
        actor_id: column_principal(row, 4)?,
        reason: row.get(5)?,
        version: column_u64(row, 6)?,
        recorded_at: column_timestamp(row, 7)?,
    })
}

fn parse_dispatch_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrewDispatch> {
    let finished_at = row
        .get::<_, Option<String>>(4)?
        .map(|raw| parse_rfc3339_utc(&raw).map_err(|err| conversion_error(4, err.to_string())))
        .transpose()?;
    Ok(CrewDispatch {
        dispatch_seq: row.get(0)?,
        incident_id: IncidentId(column_ulid(row, 1)?),
        crew_id: CrewId(column_ulid(row, 2)?),
        dispatched_at: column_timestamp(row, 3)?,
        finished_at,
    })
}

fn column_ulid(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Ulid> {
    let raw: String = row.get(index)?;
    Ulid::from_string(&raw).map_err(|_| conversion_error(index, format!("invalid ULID: {raw}")))
}

fn column_optional_ulid(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Option<Ulid>> {
    row.get::<_, Option<String>>(index)?
        .map(|raw| {
            Ulid::from_string(&raw)
                .map_err(|_| conversion_error(index, format!("invalid ULID: {raw}")))
        })
        .transpose()
}

fn column_timestamp(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| conversion_error(index, err.to_string()))
}

fn column_principal(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<PrincipalId> {
    let raw: String = row.get(index)?;
    PrincipalId::new(raw).map_err(|err| conversion_error(index, err.to_string()))
}

fn column_optional_principal(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<PrincipalId>> {
    row.get::<_, Option<String>>(index)?
        .map(|raw| PrincipalId::new(raw).map_err(|err| conversion_error(index, err.to_string())))
        .transpose()
}

fn column_u64(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(index)?;
    u64::try_from(raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("negative value: {raw}"),
            )),
        )
    })
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn u64_to_sql(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{field} out of range for sqlite: {value}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
