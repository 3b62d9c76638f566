//! Inconsistency Workflow
//!
//! `Open → InReview → {Resolved, Dismissed}`. Each operation is a single
//! atomic store update, so two racing resolutions cannot both win. Resolving
//! or dismissing an Open record assigns it to the actor first, recording both
//! steps in the history within the same update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use huddle_common::events::{CollabEvent, InconsistencyKind, InconsistencyStatus, Severity};
use huddle_common::ids::{TenantId, UserId};
use huddle_common::store::{self, keys, StateStore};
use huddle_common::{Error, Result};

use crate::eventlog::EventLog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOption {
    pub id: String,
    pub label: String,
}

/// Final decision on a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// Chosen option; `None` for a dismissal
    pub option_id: Option<String>,
    pub rationale: String,
    pub decided_by: UserId,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from: InconsistencyStatus,
    pub to: InconsistencyStatus,
    pub actor: UserId,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inconsistency {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub kind: InconsistencyKind,
    pub severity: Severity,
    pub summary: String,
    /// References to the conflicting requirement elements
    pub elements: Vec<String>,
    pub options: Vec<ResolutionOption>,
    pub status: InconsistencyStatus,
    pub assignee: Option<UserId>,
    pub resolution: Option<Resolution>,
    /// Users notified of every transition
    pub audience: BTreeSet<UserId>,
    pub history: Vec<TransitionRecord>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Inconsistency {
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Critical && !self.status.is_terminal()
    }

    fn step(&mut self, to: InconsistencyStatus, actor: &UserId, rationale: Option<&str>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::Conflict(format!(
                "inconsistency {} cannot move from {:?} to {:?}",
                self.id, self.status, to
            )));
        }
        let now = Utc::now();
        self.history.push(TransitionRecord {
            from: self.status,
            to,
            actor: actor.clone(),
            at: now,
            rationale: rationale.map(str::to_string),
        });
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// Report from the external detection logic
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInconsistency {
    pub kind: InconsistencyKind,
    pub severity: Severity,
    pub summary: String,
    #[serde(default)]
    pub elements: Vec<String>,
    #[serde(default)]
    pub options: Vec<ResolutionOption>,
    #[serde(default)]
    pub audience: BTreeSet<UserId>,
}

fn not_found(id: Uuid) -> Error {
    Error::NotFound(format!("inconsistency {id}"))
}

fn require_rationale(rationale: &str) -> Result<&str> {
    let trimmed = rationale.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("rationale must not be empty".into()));
    }
    Ok(trimmed)
}

pub struct InconsistencyService {
    store: Arc<dyn StateStore>,
    events: Arc<EventLog>,
}

impl InconsistencyService {
    pub fn new(store: Arc<dyn StateStore>, events: Arc<EventLog>) -> Self {
        Self { store, events }
    }

    pub async fn open(&self, tenant: &TenantId, report: NewInconsistency) -> Result<Inconsistency> {
        let summary = report.summary.trim();
        if summary.is_empty() {
            return Err(Error::Validation("summary must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for option in &report.options {
            if option.id.trim().is_empty() || !seen.insert(option.id.as_str()) {
                return Err(Error::Validation(
                    "resolution option ids must be non-empty and unique".into(),
                ));
            }
        }

        let now = Utc::now();
        let record = Inconsistency {
            id: Uuid::new_v4(),
            tenant_id: tenant.clone(),
            kind: report.kind,
            severity: report.severity,
            summary: summary.to_string(),
            elements: report.elements,
            options: report.options,
            status: InconsistencyStatus::Open,
            assignee: None,
            resolution: None,
            audience: report.audience,
            history: Vec::new(),
            opened_at: now,
            updated_at: now,
        };
        store::insert_typed(
            self.store.as_ref(),
            &keys::inconsistency_key(tenant, record.id),
            &record,
            None,
        )
        .await?;

        info!(
            tenant = %tenant,
            inconsistency = %record.id,
            kind = ?record.kind,
            severity = ?record.severity,
            "Inconsistency opened"
        );
        self.events
            .notify(
                tenant,
                record.audience.iter(),
                &CollabEvent::InconsistencyOpened {
                    inconsistency_id: record.id,
                    kind: record.kind,
                    severity: record.severity,
                    summary: record.summary.clone(),
                },
            )
            .await;
        Ok(record)
    }

    pub async fn get(&self, tenant: &TenantId, id: Uuid) -> Result<Option<Inconsistency>> {
        Ok(
            store::get_typed::<Inconsistency>(self.store.as_ref(), &keys::inconsistency_key(tenant, id))
                .await?
                .map(|doc| doc.value),
        )
    }

    /// Records of a tenant, optionally filtered by status, oldest first
    pub async fn list(
        &self,
        tenant: &TenantId,
        status: Option<InconsistencyStatus>,
    ) -> Result<Vec<Inconsistency>> {
        let mut records: Vec<Inconsistency> = store::scan_typed::<Inconsistency>(
            self.store.as_ref(),
            &keys::inconsistency_prefix(tenant),
        )
        .await?
        .into_iter()
        .map(|(_, doc)| doc.value)
        .filter(|r| status.map_or(true, |s| r.status == s))
        .collect();
        records.sort_by_key(|r| r.opened_at);
        Ok(records)
    }

    /// Whether the record holds the external approval gate closed
    pub async fn is_blocking(&self, tenant: &TenantId, id: Uuid) -> Result<bool> {
        let record = self.get(tenant, id).await?.ok_or_else(|| not_found(id))?;
        Ok(record.is_blocking())
    }

    /// `Open → InReview`
    pub async fn assign(&self, tenant: &TenantId, id: Uuid, assignee: &UserId) -> Result<Inconsistency> {
        let (record, steps) = self
            .transition(tenant, id, |record, steps| {
                record.step(InconsistencyStatus::InReview, assignee, None)?;
                steps.push((InconsistencyStatus::Open, InconsistencyStatus::InReview));
                record.assignee = Some(assignee.clone());
                Ok(())
            })
            .await?;
        self.announce(&record, &steps).await;
        Ok(record)
    }

    /// `InReview → Resolved` with a chosen option and a rationale
    pub async fn resolve(
        &self,
        tenant: &TenantId,
        id: Uuid,
        actor: &UserId,
        option_id: &str,
        rationale: &str,
    ) -> Result<Inconsistency> {
        let rationale = require_rationale(rationale)?;
        let option_id = option_id.trim();
        if option_id.is_empty() {
            return Err(Error::Validation("a resolution option must be chosen".into()));
        }

        let (record, steps) = self
            .transition(tenant, id, |record, steps| {
                if !record.options.is_empty() && !record.options.iter().any(|o| o.id == option_id) {
                    return Err(Error::Validation(format!(
                        "unknown resolution option '{option_id}'"
                    )));
                }
                Self::implicit_assign(record, actor, steps)?;
                record.step(InconsistencyStatus::Resolved, actor, Some(rationale))?;
                steps.push((InconsistencyStatus::InReview, InconsistencyStatus::Resolved));
                record.resolution = Some(Resolution {
                    option_id: Some(option_id.to_string()),
                    rationale: rationale.to_string(),
                    decided_by: actor.clone(),
                    decided_at: record.updated_at,
                });
                Ok(())
            })
            .await?;
        self.announce(&record, &steps).await;
        Ok(record)
    }

    /// `InReview → Dismissed` with a rationale
    pub async fn dismiss(
        &self,
        tenant: &TenantId,
        id: Uuid,
        actor: &UserId,
        rationale: &str,
    ) -> Result<Inconsistency> {
        let rationale = require_rationale(rationale)?;
        let (record, steps) = self
            .transition(tenant, id, |record, steps| {
                Self::implicit_assign(record, actor, steps)?;
                record.step(InconsistencyStatus::Dismissed, actor, Some(rationale))?;
                steps.push((InconsistencyStatus::InReview, InconsistencyStatus::Dismissed));
                record.resolution = Some(Resolution {
                    option_id: None,
                    rationale: rationale.to_string(),
                    decided_by: actor.clone(),
                    decided_at: record.updated_at,
                });
                Ok(())
            })
            .await?;
        self.announce(&record, &steps).await;
        Ok(record)
    }

    fn implicit_assign(
        record: &mut Inconsistency,
        actor: &UserId,
        steps: &mut Vec<(InconsistencyStatus, InconsistencyStatus)>,
    ) -> Result<()> {
        if record.status == InconsistencyStatus::Open {
            record.step(InconsistencyStatus::InReview, actor, None)?;
            steps.push((InconsistencyStatus::Open, InconsistencyStatus::InReview));
            record.assignee = Some(actor.clone());
        }
        Ok(())
    }

    /// One atomic update; steps recorded by a failed attempt are discarded
    async fn transition<F>(
        &self,
        tenant: &TenantId,
        id: Uuid,
        mut apply: F,
    ) -> Result<(Inconsistency, Vec<(InconsistencyStatus, InconsistencyStatus)>)>
    where
        F: FnMut(&mut Inconsistency, &mut Vec<(InconsistencyStatus, InconsistencyStatus)>) -> Result<()>
            + Send,
    {
        let mut steps = Vec::new();
        let doc = store::update_typed(
            self.store.as_ref(),
            &keys::inconsistency_key(tenant, id),
            None,
            |current: Option<Inconsistency>| {
                steps.clear();
                let mut record = current.ok_or_else(|| not_found(id))?;
                apply(&mut record, &mut steps)?;
                Ok(record)
            },
        )
        .await?;
        Ok((doc.value, steps))
    }

    async fn announce(
        &self,
        record: &Inconsistency,
        steps: &[(InconsistencyStatus, InconsistencyStatus)],
    ) {
        for (from, to) in steps {
            info!(
                inconsistency = %record.id,
                from = ?from,
                to = ?to,
                "Inconsistency status changed"
            );
            let terminal = to.is_terminal();
            let resolution = record.resolution.as_ref().filter(|_| terminal);
            self.events
                .notify(
                    &record.tenant_id,
                    record.audience.iter(),
                    &CollabEvent::InconsistencyStatusChanged {
                        inconsistency_id: record.id,
                        old_status: *from,
                        new_status: *to,
                        resolution: resolution.and_then(|r| r.option_id.clone()),
                        rationale: resolution.map(|r| r.rationale.clone()),
                    },
                )
                .await;
        }
    }
}
