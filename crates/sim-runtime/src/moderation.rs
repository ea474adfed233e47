//! Report → action → flag chain.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sim_behavior::weighted_index;
use sim_core::{
    ActionDetails, ActionType, ContentFlag, ContentReport, ModerationAction, ModerationConfig,
    ReportReason, ReportStatus, ReportTarget, User, ValidationError,
};
use tracing::debug;

use crate::new_id;

const DETAILS: [&str; 5] = [
    "This is spam or misleading content.",
    "The content promotes hate or discrimination.",
    "This content infringes on copyright.",
    "The content contains graphic or violent material.",
    "This content is harassing or abusive.",
];

const NOTES: &str = "Action taken based on report severity and content type.";

/// Everything one report produces. `flag` is set only for suppressing actions.
#[derive(Clone, Debug)]
pub struct Filed {
    pub report: ContentReport,
    pub action: ModerationAction,
    pub flag: Option<ContentFlag>,
}

/// Draw weights aligned with `ActionType::ALL`, biased by severity `s`.
pub fn action_weights(severity: f64) -> [f64; 5] {
    let s = severity.clamp(0.0, 1.0);
    [
        0.15 + 0.35 * s,  // remove
        0.30,             // warn
        0.02 + 0.18 * s,  // ban
        0.20,             // flag
        0.33 * (1.0 - s), // ignore
    ]
}

pub fn choose_action<R: Rng + ?Sized>(rng: &mut R, severity: f64) -> ActionType {
    weighted_index(rng, &action_weights(severity))
        .and_then(|i| ActionType::ALL.get(i).copied())
        .unwrap_or(ActionType::Warn)
}

/// File a report from `reporter` against `target` and resolve it immediately.
///
/// The returned report is already in its terminal status; the action points
/// back at it and the flag, if any, points at the action.
pub fn file_report<R: Rng + ?Sized>(
    cfg: &ModerationConfig,
    rng: &mut R,
    reporter: &User,
    target: ReportTarget,
    now: DateTime<Utc>,
) -> Result<Filed, ValidationError> {
    let severity = if cfg.max_severity > cfg.min_severity {
        rng.gen_range(cfg.min_severity..=cfg.max_severity)
    } else {
        cfg.min_severity
    };
    let reason = ReportReason::ALL[rng.gen_range(0..ReportReason::ALL.len())];
    let mut report = ContentReport {
        id: new_id(rng),
        reporter_id: reporter.id.clone(),
        target: target.clone(),
        reason,
        details: DETAILS[rng.gen_range(0..DETAILS.len())].to_string(),
        severity,
        status: ReportStatus::Pending,
        created_at: now,
    };

    let action_type = choose_action(rng, severity);
    report.resolve_with(action_type)?;

    let duration_days = match action_type {
        ActionType::Ban | ActionType::Warn => Some(rng.gen_range(1..=30)),
        _ => None,
    };
    let action = ModerationAction {
        id: new_id(rng),
        report_id: report.id,
        moderator_id: format!("mod-{:06}", rng.gen_range(0..1_000_000u32)),
        action_type,
        details: ActionDetails {
            reason,
            severity,
            duration_days,
            notes: NOTES.to_string(),
        },
        created_at: now,
    };

    let flag = action_type.flag_type().map(|flag_type| ContentFlag {
        id: new_id(rng),
        action_id: action.id,
        target,
        flag_type,
        reason,
        score: severity,
        created_at: now,
        expires_at: now + Duration::hours(cfg.flag_duration_hours),
    });

    debug!(
        reporter = %reporter.id,
        target = %report.target.id,
        kind = %report.target.kind,
        action = %action_type,
        flagged = flag.is_some(),
        "report filed"
    );
    Ok(Filed {
        report,
        action,
        flag,
    })
}
