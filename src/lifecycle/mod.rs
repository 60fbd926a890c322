pub mod engine;
pub mod report;
pub mod transition;

pub use engine::{EngineSettings, TransitionEngine};
pub use report::{RegistryReport, RunReport, TransitionReport};
pub use transition::{Predicate, Transition, TransitionPlan};
