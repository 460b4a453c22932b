use crate::events::{ScheduleNotification, ScheduleNotificationType};
use crate::{deserialize_id, deserialize_opt_id, Priority};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_AT_RISK_WINDOW_HOURS: i64 = 24;
pub const DEFAULT_BOTTLENECK_GAP_PCT: f64 = 15.0;

/// Production stages in pipeline order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Material,
    Guide,
    Ai,
    AdminReview,
    ClientReview,
    FinalRevision,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Material,
        Stage::Guide,
        Stage::Ai,
        Stage::AdminReview,
        Stage::ClientReview,
        Stage::FinalRevision,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Material => "material",
            Stage::Guide => "guide",
            Stage::Ai => "ai",
            Stage::AdminReview => "admin_review",
            Stage::ClientReview => "client_review",
            Stage::FinalRevision => "final_revision",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Material => "Material collection",
            Stage::Guide => "Writing guide",
            Stage::Ai => "AI drafting",
            Stage::AdminReview => "Admin review",
            Stage::ClientReview => "Client review",
            Stage::FinalRevision => "Final revision",
        }
    }

    fn recommendation(&self) -> &'static str {
        match self {
            Stage::Material => "Request the missing source material from the hospital",
            Stage::Guide => "Finalize writing guides before drafting is queued",
            Stage::Ai => "Check agent failures and queue depth for the drafting pipeline",
            Stage::AdminReview => "Assign additional admin reviewers",
            Stage::ClientReview => "Follow up with the client on pending reviews",
            Stage::FinalRevision => "Prioritize final revisions for posts close to publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace(&['-', ' '][..], "_");
        match normalized.as_str() {
            "material" => Ok(Stage::Material),
            "guide" => Ok(Stage::Guide),
            "ai" => Ok(Stage::Ai),
            "admin_review" => Ok(Stage::AdminReview),
            "client_review" => Ok(Stage::ClientReview),
            "final_revision" => Ok(Stage::FinalRevision),
            other => Err(format!("Unknown stage: {other}")),
        }
    }
}

/// Ordered so that `max` yields the worst status.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DelayStatus {
    #[default]
    OnTrack,
    AtRisk,
    Delayed,
}

impl DelayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayStatus::OnTrack => "on_track",
            DelayStatus::AtRisk => "at_risk",
            DelayStatus::Delayed => "delayed",
        }
    }
}

impl fmt::Display for DelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Completed,
    Overdue,
    AtRisk,
    OnTrack,
    /// No deadline and no completion: the post does not reach this stage.
    Unscheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulePolicy {
    pub at_risk_window_hours: i64,
    /// Percentage points a stage may trail the mean of the others before
    /// it is reported as a bottleneck.
    pub bottleneck_gap_pct: f64,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            at_risk_window_hours: DEFAULT_AT_RISK_WINDOW_HOURS,
            bottleneck_gap_pct: DEFAULT_BOTTLENECK_GAP_PCT,
        }
    }
}

impl SchedulePolicy {
    pub fn at_risk_window(&self) -> Duration {
        Duration::hours(self.at_risk_window_hours.max(0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostSchedule {
    #[serde(deserialize_with = "deserialize_id")]
    pub post_id: String,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub scheduled_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub material_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub guide_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ai_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub admin_review_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_review_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub final_revision_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub material_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub guide_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ai_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub admin_review_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_review_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub final_revision_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub delay_status: DelayStatus,
}

impl PostSchedule {
    pub fn new(post_id: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            campaign_id: None,
            scheduled_date: None,
            material_deadline: None,
            guide_deadline: None,
            ai_deadline: None,
            admin_review_deadline: None,
            client_review_deadline: None,
            final_revision_deadline: None,
            material_completed_at: None,
            guide_completed_at: None,
            ai_completed_at: None,
            admin_review_completed_at: None,
            client_review_completed_at: None,
            final_revision_completed_at: None,
            priority: Priority::default(),
            delay_status: DelayStatus::default(),
        }
    }

    pub fn deadline(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Material => self.material_deadline,
            Stage::Guide => self.guide_deadline,
            Stage::Ai => self.ai_deadline,
            Stage::AdminReview => self.admin_review_deadline,
            Stage::ClientReview => self.client_review_deadline,
            Stage::FinalRevision => self.final_revision_deadline,
        }
    }

    pub fn completed_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Material => self.material_completed_at,
            Stage::Guide => self.guide_completed_at,
            Stage::Ai => self.ai_completed_at,
            Stage::AdminReview => self.admin_review_completed_at,
            Stage::ClientReview => self.client_review_completed_at,
            Stage::FinalRevision => self.final_revision_completed_at,
        }
    }

    pub fn set_deadline(&mut self, stage: Stage, deadline: DateTime<Utc>) {
        *self.deadline_slot(stage) = Some(deadline);
    }

    /// Records a stage completion. An existing completion is never moved.
    pub fn mark_completed(&mut self, stage: Stage, at: DateTime<Utc>) -> bool {
        let slot = self.completion_slot(stage);
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        true
    }

    fn deadline_slot(&mut self, stage: Stage) -> &mut Option<DateTime<Utc>> {
        match stage {
            Stage::Material => &mut self.material_deadline,
            Stage::Guide => &mut self.guide_deadline,
            Stage::Ai => &mut self.ai_deadline,
            Stage::AdminReview => &mut self.admin_review_deadline,
            Stage::ClientReview => &mut self.client_review_deadline,
            Stage::FinalRevision => &mut self.final_revision_deadline,
        }
    }

    fn completion_slot(&mut self, stage: Stage) -> &mut Option<DateTime<Utc>> {
        match stage {
            Stage::Material => &mut self.material_completed_at,
            Stage::Guide => &mut self.guide_completed_at,
            Stage::Ai => &mut self.ai_completed_at,
            Stage::AdminReview => &mut self.admin_review_completed_at,
            Stage::ClientReview => &mut self.client_review_completed_at,
            Stage::FinalRevision => &mut self.final_revision_completed_at,
        }
    }

    /// A post reaches a stage when it has a deadline or a completion for it.
    pub fn reaches(&self, stage: Stage) -> bool {
        self.deadline(stage).is_some() || self.completed_at(stage).is_some()
    }

    pub fn is_complete(&self) -> bool {
        let mut reached = Stage::ALL.iter().filter(|stage| self.reaches(**stage)).peekable();
        reached.peek().is_some() && reached.all(|stage| self.completed_at(*stage).is_some())
    }

    /// Recomputes `delay_status`; returns the previous value when it changed.
    pub fn refresh(&mut self, now: DateTime<Utc>, policy: &SchedulePolicy) -> Option<DelayStatus> {
        let next = compute_delay_status(self, now, policy);
        if next == self.delay_status {
            return None;
        }
        Some(std::mem::replace(&mut self.delay_status, next))
    }
}

pub fn stage_state(
    schedule: &PostSchedule,
    stage: Stage,
    now: DateTime<Utc>,
    policy: &SchedulePolicy,
) -> StageState {
    if schedule.completed_at(stage).is_some() {
        return StageState::Completed;
    }
    let Some(deadline) = schedule.deadline(stage) else {
        return StageState::Unscheduled;
    };
    if deadline < now {
        StageState::Overdue
    } else if deadline - now <= policy.at_risk_window() {
        StageState::AtRisk
    } else {
        StageState::OnTrack
    }
}

/// Worst status across incomplete stages. Completed stages never count.
pub fn compute_delay_status(
    schedule: &PostSchedule,
    now: DateTime<Utc>,
    policy: &SchedulePolicy,
) -> DelayStatus {
    Stage::ALL
        .iter()
        .map(|stage| match stage_state(schedule, *stage, now, policy) {
            StageState::Overdue => DelayStatus::Delayed,
            StageState::AtRisk => DelayStatus::AtRisk,
            StageState::OnTrack | StageState::Completed | StageState::Unscheduled => {
                DelayStatus::OnTrack
            }
        })
        .max()
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageProgress {
    pub stage: Stage,
    pub completed: usize,
    pub total: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bottleneck {
    pub stage: Stage,
    pub severity: BottleneckSeverity,
    pub description: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignScheduleOverview {
    pub total_posts: usize,
    pub completed_posts: usize,
    pub delayed_posts: usize,
    #[serde(default)]
    pub at_risk_posts: usize,
    pub completion_rate: f64,
    pub stage_progress: Vec<StageProgress>,
    #[serde(default)]
    pub bottlenecks: Vec<Bottleneck>,
}

pub fn compute_overview(
    schedules: &[PostSchedule],
    now: DateTime<Utc>,
    policy: &SchedulePolicy,
) -> CampaignScheduleOverview {
    let total_posts = schedules.len();
    let completed_posts = schedules.iter().filter(|s| s.is_complete()).count();
    let mut delayed_posts = 0;
    let mut at_risk_posts = 0;
    for schedule in schedules {
        match compute_delay_status(schedule, now, policy) {
            DelayStatus::Delayed => delayed_posts += 1,
            DelayStatus::AtRisk => at_risk_posts += 1,
            DelayStatus::OnTrack => {}
        }
    }

    let stage_progress = Stage::ALL
        .iter()
        .map(|stage| {
            let total = schedules.iter().filter(|s| s.reaches(*stage)).count();
            let completed = schedules
                .iter()
                .filter(|s| s.completed_at(*stage).is_some())
                .count();
            StageProgress {
                stage: *stage,
                completed,
                total,
                percentage: percent(completed, total),
            }
        })
        .collect::<Vec<_>>();

    let bottlenecks = detect_bottlenecks(&stage_progress, policy);

    CampaignScheduleOverview {
        total_posts,
        completed_posts,
        delayed_posts,
        at_risk_posts,
        completion_rate: percent(completed_posts, total_posts),
        stage_progress,
        bottlenecks,
    }
}

/// Flags stages trailing the mean of the other reached stages by more than
/// `bottleneck_gap_pct`. Severity: low up to 1.5x the gap, medium up to 2x,
/// high beyond.
pub fn detect_bottlenecks(progress: &[StageProgress], policy: &SchedulePolicy) -> Vec<Bottleneck> {
    let reached = progress.iter().filter(|p| p.total > 0).collect::<Vec<_>>();
    if reached.len() < 2 || policy.bottleneck_gap_pct <= 0.0 {
        return Vec::new();
    }

    let mut bottlenecks = Vec::new();
    for candidate in &reached {
        let others = reached
            .iter()
            .filter(|p| p.stage != candidate.stage)
            .map(|p| p.percentage)
            .collect::<Vec<_>>();
        let mean = others.iter().sum::<f64>() / others.len() as f64;
        let gap = mean - candidate.percentage;
        if gap <= policy.bottleneck_gap_pct {
            continue;
        }
        let severity = if gap > policy.bottleneck_gap_pct * 2.0 {
            BottleneckSeverity::High
        } else if gap > policy.bottleneck_gap_pct * 1.5 {
            BottleneckSeverity::Medium
        } else {
            BottleneckSeverity::Low
        };
        bottlenecks.push(Bottleneck {
            stage: candidate.stage,
            severity,
            description: format!(
                "{} is {:.1} points behind the other stages ({:.1}% vs {:.1}%)",
                candidate.stage.label(),
                gap,
                candidate.percentage,
                mean
            ),
            recommendation: candidate.stage.recommendation().to_string(),
        });
    }
    bottlenecks.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.stage.cmp(&b.stage)));
    bottlenecks
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let raw = part as f64 / whole as f64 * 100.0;
    (raw * 10.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub post_id: String,
    pub from: DelayStatus,
    pub to: DelayStatus,
}

/// Live view of post schedules: seeded from REST snapshots and advanced by
/// schedule events.
#[derive(Debug, Default)]
pub struct ScheduleBoard {
    policy: SchedulePolicy,
    posts: BTreeMap<String, PostSchedule>,
}

impl ScheduleBoard {
    pub fn new(policy: SchedulePolicy) -> Self {
        Self {
            policy,
            posts: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn get(&self, post_id: &str) -> Option<&PostSchedule> {
        self.posts.get(post_id)
    }

    pub fn upsert(&mut self, schedule: PostSchedule) {
        self.posts.insert(schedule.post_id.clone(), schedule);
    }

    pub fn seed(&mut self, schedules: impl IntoIterator<Item = PostSchedule>) -> usize {
        let mut count = 0;
        for schedule in schedules {
            self.upsert(schedule);
            count += 1;
        }
        count
    }

    /// Folds a live schedule event into the snapshot. Only stage completions
    /// carry structural data; the rest are advisory.
    pub fn apply_event(
        &mut self,
        event: &ScheduleNotification,
        at: DateTime<Utc>,
    ) -> Option<StatusChange> {
        if event.kind != ScheduleNotificationType::StageCompleted {
            return None;
        }
        let stage = event.stage()?;
        let policy = self.policy.clone();
        let schedule = self.posts.get_mut(&event.post_id)?;
        if !schedule.mark_completed(stage, at) {
            return None;
        }
        schedule.refresh(at, &policy).map(|from| StatusChange {
            post_id: schedule.post_id.clone(),
            from,
            to: schedule.delay_status,
        })
    }

    /// Recomputes every post against `now`; returns the posts whose status moved.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Vec<StatusChange> {
        let policy = &self.policy;
        self.posts
            .values_mut()
            .filter_map(|schedule| {
                schedule.refresh(now, policy).map(|from| StatusChange {
                    post_id: schedule.post_id.clone(),
                    from,
                    to: schedule.delay_status,
                })
            })
            .collect()
    }

    pub fn overview(&self, now: DateTime<Utc>) -> CampaignScheduleOverview {
        let schedules = self.posts.values().cloned().collect::<Vec<_>>();
        compute_overview(&schedules, now, &self.policy)
    }

    pub fn campaign_overview(&self, campaign_id: &str, now: DateTime<Utc>) -> CampaignScheduleOverview {
        let schedules = self
            .posts
            .values()
            .filter(|s| s.campaign_id.as_deref() == Some(campaign_id))
            .cloned()
            .collect::<Vec<_>>();
        compute_overview(&schedules, now, &self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn schedule_with_ai_deadline(offset: Duration) -> PostSchedule {
        let mut schedule = PostSchedule::new("post-1");
        schedule.set_deadline(Stage::Ai, now() + offset);
        schedule
    }

    /// Posts that reach material, guide and ai, with `ai_done` of them
    /// finished drafting. All deadlines are a week out.
    fn drafting_batch(total: usize, ai_done: usize) -> Vec<PostSchedule> {
        (0..total)
            .map(|idx| {
                let mut schedule = PostSchedule::new(format!("post-{idx}"));
                schedule.campaign_id = Some("camp-1".to_string());
                for stage in [Stage::Material, Stage::Guide, Stage::Ai] {
                    schedule.set_deadline(stage, now() + Duration::days(7));
                }
                schedule.mark_completed(Stage::Material, now() - Duration::days(3));
                schedule.mark_completed(Stage::Guide, now() - Duration::days(2));
                if idx < ai_done {
                    schedule.mark_completed(Stage::Ai, now() - Duration::days(1));
                }
                schedule
            })
            .collect()
    }

    #[test]
    fn past_ai_deadline_without_completion_is_delayed() {
        let schedule = schedule_with_ai_deadline(-Duration::hours(1));
        let policy = SchedulePolicy::default();
        assert_eq!(stage_state(&schedule, Stage::Ai, now(), &policy), StageState::Overdue);
        assert_eq!(compute_delay_status(&schedule, now(), &policy), DelayStatus::Delayed);
    }

    #[test]
    fn ai_deadline_inside_window_is_at_risk() {
        let schedule = schedule_with_ai_deadline(Duration::minutes(30));
        let policy = SchedulePolicy {
            at_risk_window_hours: 24,
            ..SchedulePolicy::default()
        };
        assert_eq!(compute_delay_status(&schedule, now(), &policy), DelayStatus::AtRisk);
    }

    #[test]
    fn deadline_beyond_window_is_on_track() {
        let schedule = schedule_with_ai_deadline(Duration::hours(30));
        let policy = SchedulePolicy::default();
        assert_eq!(compute_delay_status(&schedule, now(), &policy), DelayStatus::OnTrack);

        let narrow = SchedulePolicy {
            at_risk_window_hours: 0,
            ..SchedulePolicy::default()
        };
        let soon = schedule_with_ai_deadline(Duration::minutes(30));
        assert_eq!(compute_delay_status(&soon, now(), &narrow), DelayStatus::OnTrack);
    }

    #[test]
    fn completed_stage_is_never_delayed_for_any_now() {
        let mut schedule = schedule_with_ai_deadline(-Duration::days(3));
        schedule.mark_completed(Stage::Ai, now() - Duration::days(1));
        let policy = SchedulePolicy::default();

        for offset_hours in [-200i64, -72, -1, 0, 1, 24, 72, 5_000] {
            let probe = now() + Duration::hours(offset_hours);
            assert_eq!(stage_state(&schedule, Stage::Ai, probe, &policy), StageState::Completed);
            assert_eq!(compute_delay_status(&schedule, probe, &policy), DelayStatus::OnTrack);
        }
    }

    #[test]
    fn worst_incomplete_stage_wins() {
        let mut schedule = PostSchedule::new("post-2");
        schedule.set_deadline(Stage::Material, now() - Duration::days(5));
        schedule.set_deadline(Stage::Guide, now() + Duration::hours(2));
        schedule.set_deadline(Stage::ClientReview, now() - Duration::hours(3));
        schedule.mark_completed(Stage::Material, now() - Duration::days(6));
        let policy = SchedulePolicy::default();

        assert_eq!(compute_delay_status(&schedule, now(), &policy), DelayStatus::Delayed);
        schedule.mark_completed(Stage::ClientReview, now());
        assert_eq!(compute_delay_status(&schedule, now(), &policy), DelayStatus::AtRisk);
    }

    #[test]
    fn mark_completed_keeps_first_timestamp() {
        let mut schedule = PostSchedule::new("post-3");
        let first = now() - Duration::hours(4);
        assert!(schedule.mark_completed(Stage::Guide, first));
        assert!(!schedule.mark_completed(Stage::Guide, now()));
        assert_eq!(schedule.completed_at(Stage::Guide), Some(first));
    }

    #[test]
    fn refresh_reports_transition_when_now_crosses_deadline() {
        let mut schedule = schedule_with_ai_deadline(Duration::hours(48));
        let policy = SchedulePolicy::default();
        assert_eq!(schedule.refresh(now(), &policy), None);
        assert_eq!(
            schedule.refresh(now() + Duration::hours(30), &policy),
            Some(DelayStatus::OnTrack)
        );
        assert_eq!(schedule.delay_status, DelayStatus::AtRisk);
        assert_eq!(
            schedule.refresh(now() + Duration::hours(49), &policy),
            Some(DelayStatus::AtRisk)
        );
        assert_eq!(schedule.delay_status, DelayStatus::Delayed);
    }

    #[test]
    fn empty_overview_is_all_zero() {
        let overview = compute_overview(&[], now(), &SchedulePolicy::default());
        assert_eq!(overview.total_posts, 0);
        assert_eq!(overview.completion_rate, 0.0);
        assert!(!overview.completion_rate.is_nan());
        assert!(overview.bottlenecks.is_empty());
        assert_eq!(overview.stage_progress.len(), Stage::ALL.len());
        assert!(overview
            .stage_progress
            .iter()
            .all(|p| p.total == 0 && p.percentage == 0.0));
    }

    #[test]
    fn overview_counts_posts_and_stage_percentages() {
        let mut schedules = drafting_batch(3, 1);
        schedules[0].mark_completed(Stage::Ai, now());
        schedules[2].set_deadline(Stage::Ai, now() - Duration::hours(2));

        let overview = compute_overview(&schedules, now(), &SchedulePolicy::default());
        assert_eq!(overview.total_posts, 3);
        assert_eq!(overview.completed_posts, 1);
        assert_eq!(overview.delayed_posts, 1);
        assert_eq!(overview.completion_rate, 33.3);

        let ai = overview
            .stage_progress
            .iter()
            .find(|p| p.stage == Stage::Ai)
            .expect("ai stage");
        assert_eq!((ai.completed, ai.total), (1, 3));
        assert_eq!(ai.percentage, 33.3);

        let admin = overview
            .stage_progress
            .iter()
            .find(|p| p.stage == Stage::AdminReview)
            .expect("admin stage");
        assert_eq!((admin.completed, admin.total), (0, 0));
    }

    #[test]
    fn lagging_stage_is_flagged_high() {
        let overview = compute_overview(&drafting_batch(4, 1), now(), &SchedulePolicy::default());
        assert_eq!(overview.bottlenecks.len(), 1);
        let bottleneck = &overview.bottlenecks[0];
        assert_eq!(bottleneck.stage, Stage::Ai);
        assert_eq!(bottleneck.severity, BottleneckSeverity::High);
        assert!(bottleneck.description.contains("AI drafting"));
        assert!(!bottleneck.recommendation.is_empty());
    }

    #[test]
    fn small_gap_is_not_a_bottleneck_and_moderate_gap_is_low() {
        let near = compute_overview(&drafting_batch(8, 7), now(), &SchedulePolicy::default());
        assert!(near.bottlenecks.is_empty(), "12.5 point gap stays under 15");

        let moderate = compute_overview(&drafting_batch(5, 4), now(), &SchedulePolicy::default());
        assert_eq!(moderate.bottlenecks.len(), 1);
        assert_eq!(moderate.bottlenecks[0].severity, BottleneckSeverity::Low);
    }

    #[test]
    fn board_folds_stage_completion_and_refreshes() {
        let mut board = ScheduleBoard::new(SchedulePolicy::default());
        let mut overdue = schedule_with_ai_deadline(-Duration::hours(1));
        overdue.delay_status = DelayStatus::Delayed;
        board.seed([overdue, schedule_with_ai_deadline(Duration::days(3)).with_id("post-9")]);
        assert_eq!(board.len(), 2);

        let event = ScheduleNotification {
            post_id: "post-1".to_string(),
            kind: ScheduleNotificationType::StageCompleted,
            stage: Some("ai".to_string()),
            delay_days: None,
            hours_remaining: None,
            urgency: None,
            message: "AI draft ready".to_string(),
        };
        let change = board.apply_event(&event, now()).expect("status change");
        assert_eq!(change.from, DelayStatus::Delayed);
        assert_eq!(change.to, DelayStatus::OnTrack);
        assert!(board.apply_event(&event, now()).is_none());

        let changes = board.refresh(now() + Duration::days(2) + Duration::hours(1));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].post_id, "post-9");
        assert_eq!(changes[0].to, DelayStatus::AtRisk);
    }

    #[test]
    fn board_ignores_advisory_and_unknown_posts() {
        let mut board = ScheduleBoard::new(SchedulePolicy::default());
        board.upsert(schedule_with_ai_deadline(Duration::days(3)));
        let advisory = ScheduleNotification {
            post_id: "post-1".to_string(),
            kind: ScheduleNotificationType::DeadlineApproaching,
            stage: Some("ai".to_string()),
            delay_days: None,
            hours_remaining: Some(3.0),
            urgency: None,
            message: String::new(),
        };
        assert!(board.apply_event(&advisory, now()).is_none());
        assert!(board.get("post-1").and_then(|s| s.ai_completed_at).is_none());

        let unknown = ScheduleNotification {
            post_id: "missing".to_string(),
            kind: ScheduleNotificationType::StageCompleted,
            ..advisory
        };
        assert!(board.apply_event(&unknown, now()).is_none());
    }

    #[test]
    fn schedule_snapshot_parses_backend_shape() {
        let schedule: PostSchedule = serde_json::from_str(
            r#"{
                "post_id": 44,
                "campaign_id": 3,
                "scheduled_date": "2026-11-01T09:00:00Z",
                "ai_deadline": "2026-10-20T09:00:00Z",
                "material_completed_at": "2026-10-10T09:00:00Z",
                "priority": 1,
                "delay_status": "at_risk"
            }"#,
        )
        .expect("parse schedule");
        assert_eq!(schedule.post_id, "44");
        assert_eq!(schedule.campaign_id.as_deref(), Some("3"));
        assert_eq!(schedule.priority, Priority::High);
        assert_eq!(schedule.delay_status, DelayStatus::AtRisk);
        assert!(schedule.reaches(Stage::Material));
        assert!(!schedule.reaches(Stage::Guide));
    }

    impl PostSchedule {
        fn with_id(mut self, post_id: &str) -> Self {
            self.post_id = post_id.to_string();
            self
        }
    }
}
