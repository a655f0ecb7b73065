//! Speculative response generation and the correction/pivot decision.

pub mod correction;
pub mod engine;

pub use correction::{CorrectionConfig, ReconcileDecision, reconcile, similarity};
pub use engine::{
    AttemptId, AttemptStatus, SpeculationConfig, SpeculationEngine, SpeculationOutcome,
    TokenReceiver,
};
