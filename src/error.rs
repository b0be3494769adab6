//! Logic faults of the simulation core.
//!
//! These never happen in a correctly scheduled simulation: the coordinator and
//! the transmission engine filter agents before acting on them. If one is
//! raised anyway, the run is aborted instead of silently continuing.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Fault {
    /// A test was issued to an agent that is still waiting for a result.
    #[error("agent {0} already has a pending test")]
    PendingTest(String),

    /// A test result was requested for an agent without a pending test.
    #[error("agent {0} has no pending test")]
    NoPendingTest(String),

    /// A transmission was staged for an agent that is not susceptible.
    #[error("agent {0} is not susceptible")]
    NotSusceptible(String),

    /// A transmission was staged twice for the same agent in one day.
    #[error("agent {0} is already staged for infection")]
    AlreadyStaged(String),

    /// A test type is referenced that is not defined.
    #[error("unknown test type {0:?}")]
    UnknownTest(String),
}
