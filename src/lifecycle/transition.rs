// ============================================================================
// Lifecycle transitions
// ============================================================================
//
// The state machine is data: a registry's plan is an ordered list of
// (from, to, predicate) edges. Each edge is evaluated as an independent pass.
//
//   Active ──> CommissionReview ──> Awarded ──┐
//     │                  └──────> Unclear ───┤
//     ├──────────────────────────────────────┴──> Completed
//     ├──> Unknown   (44-FZ only)
//     └──> Bad       (44-FZ only)
//
// ============================================================================

use crate::core::{ContractRecord, MigrationError, Registry, Result, Stage};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bidding closes within this many days of today -> commission review.
pub const COMMISSION_LEAD_DAYS: i64 = 1;
/// Commission review with no delivery after this many days -> unclear.
pub const UNCLEAR_AFTER_DAYS: i64 = 60;
/// Active with no delivery after this many days -> unknown.
pub const UNKNOWN_AFTER_DAYS: i64 = 180;
/// Delivery finished at least this many days ago -> completed.
pub const DEFAULT_COMPLETION_GRACE_DAYS: u32 = 90;

/// Time-based eligibility condition for one transition.
///
/// Every predicate has two renderings that must agree: [`Predicate::matches`]
/// for stores that evaluate rows in process, and [`Predicate::sql`] for SQL
/// stores. The SQL form only ever embeds constants from this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Predicate {
    /// `end_date` set and `end_date <= today + 1d`
    BiddingClosed,
    /// `delivery_start_date` set
    DeliveryStarted,
    /// `end_date` set, `end_date < today - 60d`, `delivery_start_date` unset
    StalledInCommission,
    /// `delivery_end_date` set and `delivery_end_date < today - grace_days`
    DeliveryFinished { grace_days: u32 },
    /// `delivery_end_date` unset, `end_date` set, `end_date < today - 180d`
    StaleWithoutDelivery,
    /// `delivery_end_date` unset and `end_date` unset
    MissingDates,
}

impl Predicate {
    pub fn matches(&self, record: &ContractRecord, today: NaiveDate) -> bool {
        match *self {
            Predicate::BiddingClosed => record
                .end_date
                .is_some_and(|end| end <= today + Duration::days(COMMISSION_LEAD_DAYS)),
            Predicate::DeliveryStarted => record.delivery_start_date.is_some(),
            Predicate::StalledInCommission => {
                record.delivery_start_date.is_none()
                    && record
                        .end_date
                        .is_some_and(|end| end < today - Duration::days(UNCLEAR_AFTER_DAYS))
            }
            Predicate::DeliveryFinished { grace_days } => record
                .delivery_end_date
                .is_some_and(|end| end < today - Duration::days(i64::from(grace_days))),
            Predicate::StaleWithoutDelivery => {
                record.delivery_end_date.is_none()
                    && record
                        .end_date
                        .is_some_and(|end| end < today - Duration::days(UNKNOWN_AFTER_DAYS))
            }
            Predicate::MissingDates => {
                record.delivery_end_date.is_none() && record.end_date.is_none()
            }
        }
    }

    /// Whether the condition depends on the run date at all.
    pub fn uses_today(&self) -> bool {
        !matches!(self, Predicate::DeliveryStarted | Predicate::MissingDates)
    }

    /// SQL condition over the stage table's columns. `today` is the
    /// placeholder bound to the run date, e.g. `"$2"`.
    pub fn sql(&self, today: &str) -> String {
        match *self {
            Predicate::BiddingClosed => format!(
                "end_date IS NOT NULL AND end_date <= {today}::date + {COMMISSION_LEAD_DAYS}"
            ),
            Predicate::DeliveryStarted => "delivery_start_date IS NOT NULL".to_string(),
            Predicate::StalledInCommission => format!(
                "end_date IS NOT NULL AND end_date < {today}::date - {UNCLEAR_AFTER_DAYS} \
                 AND delivery_start_date IS NULL"
            ),
            Predicate::DeliveryFinished { grace_days } => format!(
                "delivery_end_date IS NOT NULL AND delivery_end_date < {today}::date - {grace_days}"
            ),
            Predicate::StaleWithoutDelivery => format!(
                "delivery_end_date IS NULL AND end_date IS NOT NULL \
                 AND end_date < {today}::date - {UNKNOWN_AFTER_DAYS}"
            ),
            Predicate::MissingDates => {
                "delivery_end_date IS NULL AND end_date IS NULL".to_string()
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::BiddingClosed => write!(f, "end_date <= today+{}d", COMMISSION_LEAD_DAYS),
            Predicate::DeliveryStarted => write!(f, "delivery_start_date set"),
            Predicate::StalledInCommission => write!(
                f,
                "end_date < today-{}d, no delivery start",
                UNCLEAR_AFTER_DAYS
            ),
            Predicate::DeliveryFinished { grace_days } => {
                write!(f, "delivery_end_date < today-{}d", grace_days)
            }
            Predicate::StaleWithoutDelivery => write!(
                f,
                "end_date < today-{}d, no delivery end",
                UNKNOWN_AFTER_DAYS
            ),
            Predicate::MissingDates => write!(f, "no end_date, no delivery_end_date"),
        }
    }
}

/// One directed edge of the lifecycle graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Stage,
    pub to: Stage,
    pub predicate: Predicate,
}

impl Transition {
    pub const fn new(from: Stage, to: Stage, predicate: Predicate) -> Self {
        Self { from, to, predicate }
    }

    /// Stable key used in reports and log fields, e.g. `commission_review->unclear`.
    pub fn key(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} [{}]", self.from, self.to, self.predicate)
    }
}

/// The ordered passes for one registry.
#[derive(Debug, Clone)]
pub struct TransitionPlan {
    registry: Registry,
    transitions: Vec<Transition>,
}

impl TransitionPlan {
    /// The daily plan.
    ///
    /// Unknown is tried before CommissionReview: every Unknown candidate also
    /// satisfies the bidding-closed predicate, so it could never fire later.
    /// Completed drains every non-terminal stage last, after the forward
    /// moves of this run have settled.
    pub fn standard(registry: Registry, completion_grace_days: u32) -> Result<Self> {
        let finished = Predicate::DeliveryFinished { grace_days: completion_grace_days };
        let mut transitions = Vec::with_capacity(10);

        if registry.supports(Stage::Bad) {
            transitions.push(Transition::new(Stage::Active, Stage::Bad, Predicate::MissingDates));
        }
        if registry.supports(Stage::Unknown) {
            transitions.push(Transition::new(
                Stage::Active,
                Stage::Unknown,
                Predicate::StaleWithoutDelivery,
            ));
        }
        transitions.extend([
            Transition::new(Stage::Active, Stage::CommissionReview, Predicate::BiddingClosed),
            Transition::new(Stage::CommissionReview, Stage::Awarded, Predicate::DeliveryStarted),
            Transition::new(Stage::CommissionReview, Stage::Unclear, Predicate::StalledInCommission),
            Transition::new(Stage::Active, Stage::Completed, finished),
            Transition::new(Stage::CommissionReview, Stage::Completed, finished),
            Transition::new(Stage::Unclear, Stage::Completed, finished),
            Transition::new(Stage::Awarded, Stage::Completed, finished),
        ]);

        Self::new(registry, transitions)
    }

    pub fn new(registry: Registry, transitions: Vec<Transition>) -> Result<Self> {
        let plan = Self { registry, transitions };
        plan.validate()?;
        Ok(plan)
    }

    pub fn registry(&self) -> Registry {
        self.registry
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter()
    }

    pub fn find(&self, from: Stage, to: Stage) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.from == from && t.to == to)
    }

    fn validate(&self) -> Result<()> {
        for t in &self.transitions {
            if !self.registry.supports(t.from) || !self.registry.supports(t.to) {
                return Err(MigrationError::Invariant(format!(
                    "{}: transition {} uses a stage the registry does not have",
                    self.registry, t
                )));
            }
            if t.from.is_terminal() {
                return Err(MigrationError::Invariant(format!(
                    "{}: transition {} leaves a terminal stage",
                    self.registry, t
                )));
            }
            if t.to.rank() <= t.from.rank() {
                return Err(MigrationError::Invariant(format!(
                    "{}: transition {} does not move forward",
                    self.registry, t
                )));
            }
        }

        let position = |to: Stage| {
            self.transitions
                .iter()
                .position(|t| t.from == Stage::CommissionReview && t.to == to)
        };
        if let (Some(awarded), Some(unclear)) = (position(Stage::Awarded), position(Stage::Unclear))
            && awarded > unclear
        {
            return Err(MigrationError::Invariant(format!(
                "{}: awarded must be evaluated before unclear",
                self.registry
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()
    }

    fn days_ago(n: i64) -> NaiveDate {
        today() - Duration::days(n)
    }

    #[test]
    fn bidding_closed_includes_tomorrow() {
        let p = Predicate::BiddingClosed;
        assert!(p.matches(&ContractRecord::new(1).end_date(today() + Duration::days(1)), today()));
        assert!(!p.matches(&ContractRecord::new(1).end_date(today() + Duration::days(2)), today()));
        assert!(!p.matches(&ContractRecord::new(1), today()));
    }

    #[test]
    fn stalled_requires_no_delivery_start() {
        let p = Predicate::StalledInCommission;
        let stale = ContractRecord::new(1).end_date(days_ago(61));
        assert!(p.matches(&stale, today()));
        assert!(!p.matches(&stale.clone().delivery_start_date(days_ago(5)), today()));
        assert!(!p.matches(&ContractRecord::new(1).end_date(days_ago(60)), today()));
    }

    #[test]
    fn delivery_finished_honours_grace() {
        let p = Predicate::DeliveryFinished { grace_days: 90 };
        assert!(p.matches(&ContractRecord::new(1).delivery_end_date(days_ago(91)), today()));
        assert!(!p.matches(&ContractRecord::new(1).delivery_end_date(days_ago(90)), today()));
        let immediate = Predicate::DeliveryFinished { grace_days: 0 };
        assert!(immediate.matches(&ContractRecord::new(1).delivery_end_date(days_ago(1)), today()));
    }

    #[test]
    fn malformed_predicates_are_disjoint() {
        let bad = ContractRecord::new(1);
        let unknown = ContractRecord::new(2).end_date(days_ago(181));
        assert!(Predicate::MissingDates.matches(&bad, today()));
        assert!(!Predicate::StaleWithoutDelivery.matches(&bad, today()));
        assert!(Predicate::StaleWithoutDelivery.matches(&unknown, today()));
        assert!(!Predicate::MissingDates.matches(&unknown, today()));
    }

    #[test]
    fn sql_embeds_only_the_placeholder() {
        let sql = Predicate::StalledInCommission.sql("$2");
        assert!(sql.contains("$2::date - 60"));
        assert!(sql.contains("delivery_start_date IS NULL"));
        let sql = Predicate::DeliveryFinished { grace_days: 90 }.sql("$1");
        assert_eq!(sql, "delivery_end_date IS NOT NULL AND delivery_end_date < $1::date - 90");
    }

    #[test]
    fn standard_plans_differ_by_registry() {
        let fz44 = TransitionPlan::standard(Registry::Fz44, 90).unwrap();
        let fz223 = TransitionPlan::standard(Registry::Fz223, 90).unwrap();
        assert_eq!(fz44.transitions().len(), 9);
        assert_eq!(fz223.transitions().len(), 7);
        assert!(fz44.find(Stage::Active, Stage::Unknown).is_some());
        assert!(fz223.find(Stage::Active, Stage::Bad).is_none());
    }

    #[test]
    fn awarded_precedes_unclear() {
        let plan = TransitionPlan::standard(Registry::Fz44, 90).unwrap();
        let keys: Vec<_> = plan.iter().map(Transition::key).collect();
        let awarded = keys.iter().position(|k| k == "commission_review->awarded").unwrap();
        let unclear = keys.iter().position(|k| k == "commission_review->unclear").unwrap();
        assert!(awarded < unclear);

        let reversed = vec![
            Transition::new(Stage::CommissionReview, Stage::Unclear, Predicate::StalledInCommission),
            Transition::new(Stage::CommissionReview, Stage::Awarded, Predicate::DeliveryStarted),
        ];
        assert!(TransitionPlan::new(Registry::Fz44, reversed).is_err());
    }

    #[test]
    fn backward_and_foreign_edges_are_rejected() {
        let backward = vec![Transition::new(Stage::Awarded, Stage::CommissionReview, Predicate::MissingDates)];
        assert!(TransitionPlan::new(Registry::Fz44, backward).is_err());

        let sideways = vec![Transition::new(Stage::Unclear, Stage::Awarded, Predicate::DeliveryStarted)];
        assert!(TransitionPlan::new(Registry::Fz44, sideways).is_err());

        let foreign = vec![Transition::new(Stage::Active, Stage::Bad, Predicate::MissingDates)];
        assert!(TransitionPlan::new(Registry::Fz223, foreign).is_err());

        let from_terminal = vec![Transition::new(Stage::Completed, Stage::Bad, Predicate::MissingDates)];
        assert!(TransitionPlan::new(Registry::Fz44, from_terminal).is_err());
    }
}
