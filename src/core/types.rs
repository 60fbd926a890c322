use super::{MigrationError, Result, Value};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Contract identity, stable across every stage of its lifecycle.
pub type ContractId = i64;

// ============================================================================
// Registry
// ============================================================================

/// One of the two procurement-law taxonomies. Each owns an independent chain
/// of stage tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Registry {
    #[serde(rename = "44_fz")]
    Fz44,
    #[serde(rename = "223_fz")]
    Fz223,
}

impl Registry {
    /// Processing order within a run.
    pub const ALL: [Registry; 2] = [Registry::Fz44, Registry::Fz223];

    pub fn stages(&self) -> &'static [Stage] {
        const FZ44: [Stage; 7] = [
            Stage::Active,
            Stage::CommissionReview,
            Stage::Unclear,
            Stage::Awarded,
            Stage::Completed,
            Stage::Unknown,
            Stage::Bad,
        ];
        const FZ223: [Stage; 5] = [
            Stage::Active,
            Stage::CommissionReview,
            Stage::Unclear,
            Stage::Awarded,
            Stage::Completed,
        ];
        match self {
            Registry::Fz44 => &FZ44,
            Registry::Fz223 => &FZ223,
        }
    }

    pub fn supports(&self, stage: Stage) -> bool {
        self.stages().contains(&stage)
    }

    pub fn key(&self) -> &'static str {
        match self {
            Registry::Fz44 => "44_fz",
            Registry::Fz223 => "223_fz",
        }
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Registry::Fz44 => write!(f, "44-FZ"),
            Registry::Fz223 => write!(f, "223-FZ"),
        }
    }
}

impl FromStr for Registry {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "44" | "44_fz" | "44-fz" | "fz44" => Ok(Registry::Fz44),
            "223" | "223_fz" | "223-fz" | "fz223" => Ok(Registry::Fz223),
            other => Err(MigrationError::Config(format!("unknown registry '{}'", other))),
        }
    }
}

// ============================================================================
// Stage
// ============================================================================

/// Lifecycle bucket. Each (registry, stage) pair is one physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Active,
    CommissionReview,
    Unclear,
    Awarded,
    Completed,
    Unknown,
    Bad,
}

impl Stage {
    /// Position along the lifecycle. Transitions must strictly increase it.
    ///
    /// ```text
    /// Active(0) -> CommissionReview(1) -> Unclear(2) | Awarded(2) -> Completed(3)
    ///   └──────────────────────────────────────────> Unknown(3) | Bad(3)
    /// ```
    pub fn rank(&self) -> u8 {
        match self {
            Stage::Active => 0,
            Stage::CommissionReview => 1,
            Stage::Unclear | Stage::Awarded => 2,
            Stage::Completed | Stage::Unknown | Stage::Bad => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Unknown | Stage::Bad)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Active => "active",
            Stage::CommissionReview => "commission_review",
            Stage::Unclear => "unclear",
            Stage::Awarded => "awarded",
            Stage::Completed => "completed",
            Stage::Unknown => "unknown",
            Stage::Bad => "bad",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Stage {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "main" => Ok(Stage::Active),
            "commission_review" | "commission_work" | "commission" => Ok(Stage::CommissionReview),
            "unclear" => Ok(Stage::Unclear),
            "awarded" => Ok(Stage::Awarded),
            "completed" => Ok(Stage::Completed),
            "unknown" => Ok(Stage::Unknown),
            "bad" => Ok(Stage::Bad),
            other => Err(MigrationError::Config(format!("unknown stage '{}'", other))),
        }
    }
}

// ============================================================================
// TableId
// ============================================================================

/// A validated (registry, stage) pair. The only way to name a stage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    registry: Registry,
    stage: Stage,
}

impl TableId {
    pub fn new(registry: Registry, stage: Stage) -> Result<Self> {
        if !registry.supports(stage) {
            return Err(MigrationError::Invariant(format!(
                "{} has no '{}' stage",
                registry, stage
            )));
        }
        Ok(Self { registry, stage })
    }

    /// The registry's base table, where ingestion appends new contracts.
    pub fn base(registry: Registry) -> Self {
        Self { registry, stage: Stage::Active }
    }

    pub fn all(registry: Registry) -> impl Iterator<Item = TableId> {
        registry.stages().iter().map(move |&stage| TableId { registry, stage })
    }

    pub fn registry(&self) -> Registry {
        self.registry
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Physical table name. Static for every valid pair.
    pub fn name(&self) -> &'static str {
        match (self.registry, self.stage) {
            (Registry::Fz44, Stage::Active) => "reestr_contract_44_fz",
            (Registry::Fz44, Stage::CommissionReview) => "reestr_contract_44_fz_commission_work",
            (Registry::Fz44, Stage::Unclear) => "reestr_contract_44_fz_unclear",
            (Registry::Fz44, Stage::Awarded) => "reestr_contract_44_fz_awarded",
            (Registry::Fz44, Stage::Completed) => "reestr_contract_44_fz_completed",
            (Registry::Fz44, Stage::Unknown) => "reestr_contract_44_fz_unknown",
            (Registry::Fz44, Stage::Bad) => "reestr_contract_44_fz_bad",
            (Registry::Fz223, Stage::Active) => "reestr_contract_223_fz",
            (Registry::Fz223, Stage::CommissionReview) => "reestr_contract_223_fz_commission_work",
            (Registry::Fz223, Stage::Unclear) => "reestr_contract_223_fz_unclear",
            (Registry::Fz223, Stage::Awarded) => "reestr_contract_223_fz_awarded",
            (Registry::Fz223, Stage::Completed) => "reestr_contract_223_fz_completed",
            // Unreachable through `new`, which rejects these pairs.
            (Registry::Fz223, Stage::Unknown) => "reestr_contract_223_fz_unknown",
            (Registry::Fz223, Stage::Bad) => "reestr_contract_223_fz_bad",
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Contract rows
// ============================================================================

/// A full contract row as held by any stage table.
///
/// Only the three lifecycle dates are read by the engine. Everything else is
/// kept in `fields` and copied verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub id: ContractId,
    pub end_date: Option<NaiveDate>,
    pub delivery_start_date: Option<NaiveDate>,
    pub delivery_end_date: Option<NaiveDate>,
    pub fields: BTreeMap<String, Value>,
}

impl ContractRecord {
    pub fn new(id: ContractId) -> Self {
        Self {
            id,
            end_date: None,
            delivery_start_date: None,
            delivery_end_date: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn end_date(mut self, date: NaiveDate) -> Self {
        self.end_date = Some(date);
        self
    }

    pub fn delivery_start_date(mut self, date: NaiveDate) -> Self {
        self.delivery_start_date = Some(date);
        self
    }

    pub fn delivery_end_date(mut self, date: NaiveDate) -> Self {
        self.delivery_end_date = Some(date);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// A dependent row owned by the document-processing subsystem. It points at a
/// contract id only, never at the stage table that currently holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLink {
    pub id: u64,
    pub registry: Registry,
    pub contract_id: ContractId,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_names_are_unique_and_prefixed() {
        let mut seen = HashSet::new();
        for registry in Registry::ALL {
            for table in TableId::all(registry) {
                assert!(seen.insert(table.name()), "duplicate {}", table.name());
                let prefix = match registry {
                    Registry::Fz44 => "reestr_contract_44_fz",
                    Registry::Fz223 => "reestr_contract_223_fz",
                };
                assert!(table.name().starts_with(prefix));
            }
        }
        assert_eq!(seen.len(), 12);
    }

    #[test]
    fn fz223_rejects_malformed_stages() {
        assert!(TableId::new(Registry::Fz223, Stage::Unknown).is_err());
        assert!(TableId::new(Registry::Fz223, Stage::Bad).is_err());
        assert!(TableId::new(Registry::Fz44, Stage::Bad).is_ok());
    }

    #[test]
    fn registry_parses_common_spellings() {
        assert_eq!("44".parse::<Registry>().unwrap(), Registry::Fz44);
        assert_eq!("223-FZ".parse::<Registry>().unwrap(), Registry::Fz223);
        assert!("94".parse::<Registry>().is_err());
    }

    #[test]
    fn terminal_stages_have_highest_rank() {
        for stage in Registry::Fz44.stages() {
            if stage.is_terminal() {
                assert_eq!(stage.rank(), 3);
            } else {
                assert!(stage.rank() < 3);
            }
        }
    }
}
