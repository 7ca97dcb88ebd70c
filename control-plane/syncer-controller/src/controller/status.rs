use chrono::{SecondsFormat, Utc};
use kube::Resource;
use syncer_models::{
    Condition, ConditionStatus, ConditionType, SyncSource, SyncSourceStatus, TargetRef,
};

/// Outcome of converging every target of one source.
#[derive(Clone, Debug, Default)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Targets in sync or just written, sorted
    pub targets: Vec<TargetRef>,
    pub blocked: Vec<BlockedTarget>,
    /// Explicit destinations that do not exist
    pub missing: Vec<String>,
    /// A write raced with a concurrent delete; look again soon
    pub requeue: bool,
}

/// A desired target the controller may not touch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockedTarget {
    pub target: TargetRef,
    pub held_by: String,
}

impl SyncReport {
    pub fn new(missing: Vec<String>) -> Self {
        Self {
            missing,
            ..Default::default()
        }
    }

    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn cond(
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) -> Condition {
    Condition {
        type_,
        status,
        reason: Some(reason.to_string()),
        message: Some(message.into()),
        last_transition_time: None,
    }
}

fn cond_rank(t: ConditionType) -> u8 {
    match t {
        ConditionType::Ready => 0,
        ConditionType::Synced => 1,
        ConditionType::Error => 2,
    }
}

/// Upsert `incoming`. The transition time only moves when the status value
/// changes.
pub fn set_condition(conds: &mut Vec<Condition>, mut incoming: Condition, now: &str) {
    match conds.iter_mut().find(|c| c.type_ == incoming.type_) {
        Some(existing) => {
            incoming.last_transition_time = if existing.status == incoming.status {
                existing.last_transition_time.clone()
            } else {
                Some(now.to_string())
            };
            *existing = incoming;
        }
        None => {
            incoming.last_transition_time = Some(now.to_string());
            conds.push(incoming);
        }
    }
    conds.sort_by_key(|c| cond_rank(c.type_));
}

pub fn remove_condition(conds: &mut Vec<Condition>, type_: ConditionType) {
    conds.retain(|c| c.type_ != type_);
}

fn base(source: &SyncSource) -> SyncSourceStatus {
    let mut status = source.status.clone().unwrap_or_default();
    status.observed_generation = source.meta().generation;
    status
}

/// Status after a completed converge pass.
pub fn synced(source: &SyncSource, report: &SyncReport, now: &str) -> SyncSourceStatus {
    let mut status = base(source);
    status.targets = report.targets.clone();
    let conds = &mut status.conditions;
    if !report.blocked.is_empty() {
        let detail = report
            .blocked
            .iter()
            .map(|b| {
                format!(
                    "{} {}/{} is held by {}",
                    b.target.kind, b.target.namespace, b.target.name, b.held_by
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        set_condition(
            conds,
            cond(
                ConditionType::Ready,
                ConditionStatus::False,
                "PartiallySynced",
                format!(
                    "{} of {} targets blocked",
                    report.blocked.len(),
                    report.blocked.len() + report.targets.len()
                ),
            ),
            now,
        );
        set_condition(
            conds,
            cond(ConditionType::Synced, ConditionStatus::False, "TargetConflict", detail.clone()),
            now,
        );
        set_condition(
            conds,
            cond(ConditionType::Error, ConditionStatus::True, "TargetConflict", detail),
            now,
        );
        return status;
    }

    let in_sync = format!("{} target(s) in sync", report.targets.len());
    if report.missing.is_empty() {
        set_condition(
            conds,
            cond(ConditionType::Ready, ConditionStatus::True, "Synced", in_sync.clone()),
            now,
        );
    } else {
        set_condition(
            conds,
            cond(
                ConditionType::Ready,
                ConditionStatus::False,
                "DestinationsMissing",
                format!("namespaces not found: {}", report.missing.join(", ")),
            ),
            now,
        );
    }
    set_condition(
        conds,
        cond(ConditionType::Synced, ConditionStatus::True, "Synced", in_sync),
        now,
    );
    remove_condition(conds, ConditionType::Error);
    status
}

fn rejected_with(source: &SyncSource, reason: &str, message: &str, now: &str) -> SyncSourceStatus {
    let mut status = base(source);
    let conds = &mut status.conditions;
    for type_ in [ConditionType::Ready, ConditionType::Synced] {
        set_condition(conds, cond(type_, ConditionStatus::False, reason, message), now);
    }
    set_condition(
        conds,
        cond(ConditionType::Error, ConditionStatus::True, reason, message),
        now,
    );
    status
}

/// Status for a source whose spec cannot be converged as written.
pub fn invalid(source: &SyncSource, message: &str, now: &str) -> SyncSourceStatus {
    rejected_with(source, "InvalidSpec", message, now)
}

/// Status for a source whose targets the store refused to accept.
pub fn rejected(source: &SyncSource, message: &str, now: &str) -> SyncSourceStatus {
    rejected_with(source, "TargetRejected", message, now)
}

/// Status once retries for a source ran out.
pub fn failed(source: &SyncSource, message: &str, now: &str) -> SyncSourceStatus {
    let mut status = base(source);
    let conds = &mut status.conditions;
    set_condition(
        conds,
        cond(ConditionType::Ready, ConditionStatus::False, "SyncFailed", message),
        now,
    );
    set_condition(
        conds,
        cond(ConditionType::Synced, ConditionStatus::Unknown, "SyncFailed", message),
        now,
    );
    set_condition(
        conds,
        cond(ConditionType::Error, ConditionStatus::True, "SyncFailed", message),
        now,
    );
    status
}

/// Whether writing `next` would change anything.
pub fn should_write(source: &SyncSource, next: &SyncSourceStatus) -> bool {
    source.status.as_ref() != Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncer_models::{SyncSourceSpec, TargetKind};

    const T0: &str = "2025-01-01T00:00:00Z";
    const T1: &str = "2025-01-01T00:05:00Z";

    fn source() -> SyncSource {
        let mut s = SyncSource::new("foo", SyncSourceSpec::default());
        s.metadata.namespace = Some("a".into());
        s.metadata.generation = Some(3);
        s
    }

    fn tref(ns: &str) -> TargetRef {
        TargetRef {
            kind: TargetKind::ConfigMap,
            namespace: ns.into(),
            name: "foo".into(),
        }
    }

    #[test]
    fn transition_time_kept_while_status_unchanged() {
        let mut conds = Vec::new();
        set_condition(
            &mut conds,
            cond(ConditionType::Ready, ConditionStatus::True, "Synced", "1"),
            T0,
        );
        set_condition(
            &mut conds,
            cond(ConditionType::Ready, ConditionStatus::True, "Synced", "2"),
            T1,
        );
        assert_eq!(conds[0].last_transition_time.as_deref(), Some(T0));
        assert_eq!(conds[0].message.as_deref(), Some("2"));

        set_condition(
            &mut conds,
            cond(ConditionType::Ready, ConditionStatus::False, "X", "3"),
            T1,
        );
        assert_eq!(conds[0].last_transition_time.as_deref(), Some(T1));
    }

    #[test]
    fn success_clears_error_and_records_generation() {
        let mut src = source();
        src.status = Some(invalid(&src, "bad", T0));
        let report = SyncReport {
            targets: vec![tref("b")],
            ..Default::default()
        };
        let st = synced(&src, &report, T1);
        assert_eq!(st.observed_generation, Some(3));
        assert_eq!(st.targets, vec![tref("b")]);
        assert_eq!(st.conditions.len(), 2);
        assert_eq!(st.conditions[0].type_, ConditionType::Ready);
        assert_eq!(st.conditions[0].status, ConditionStatus::True);
        assert!(st.conditions.iter().all(|c| c.type_ != ConditionType::Error));
    }

    #[test]
    fn store_rejection_sets_every_condition() {
        let src = source();
        let st = rejected(&src, "create ConfigMap b/foo: invalid: immutable", T0);
        let reasons: Vec<_> = st
            .conditions
            .iter()
            .map(|c| (c.type_, c.status, c.reason.as_deref()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (ConditionType::Ready, ConditionStatus::False, Some("TargetRejected")),
                (ConditionType::Synced, ConditionStatus::False, Some("TargetRejected")),
                (ConditionType::Error, ConditionStatus::True, Some("TargetRejected")),
            ]
        );
        assert!(st.conditions[2].message.as_deref().unwrap().contains("immutable"));
    }

    #[test]
    fn repeated_success_is_not_a_change() {
        let mut src = source();
        let report = SyncReport {
            targets: vec![tref("b")],
            ..Default::default()
        };
        src.status = Some(synced(&src, &report, T0));
        let again = synced(&src, &report, T1);
        assert!(!should_write(&src, &again));
    }

    #[test]
    fn blocked_targets_surface_as_error() {
        let src = source();
        let report = SyncReport {
            targets: vec![tref("c")],
            blocked: vec![BlockedTarget {
                target: tref("b"),
                held_by: "SyncSource z/other".into(),
            }],
            ..Default::default()
        };
        let st = synced(&src, &report, T0);
        let ready = &st.conditions[0];
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some("PartiallySynced"));
        let err = st
            .conditions
            .iter()
            .find(|c| c.type_ == ConditionType::Error)
            .unwrap();
        assert!(err.message.as_deref().unwrap().contains("z/other"));
    }

    #[test]
    fn missing_destinations_keep_synced_true() {
        let src = source();
        let report = SyncReport {
            targets: vec![tref("b")],
            missing: vec!["zz".into()],
            ..Default::default()
        };
        let st = synced(&src, &report, T0);
        assert_eq!(st.conditions[0].status, ConditionStatus::False);
        assert_eq!(st.conditions[0].reason.as_deref(), Some("DestinationsMissing"));
        assert_eq!(st.conditions[1].status, ConditionStatus::True);
    }
}
