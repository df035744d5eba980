//! Failure categories surfaced to the operator by the migration runner.
use crate::model::RunParameters;
use std::fmt;
use thiserror::Error;

/// The runner step whose reported count disagreed with the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStep {
    Read,
    Stage,
    Complete,
}

impl fmt::Display for BatchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStep::Read => "read",
            BatchStep::Stage => "staged",
            BatchStep::Complete => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointProblems {
    pub endpoint_name: String,
    pub problems: Vec<String>,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("{}", mismatch_message(.endpoint, .persisted, .requested))]
    RunParametersMismatch {
        endpoint: String,
        persisted: RunParameters,
        requested: RunParameters,
    },
    #[error("{}", preflight_message(.0))]
    PreflightFailed(Vec<EndpointProblems>),
    #[error("The amount of {step} timeouts does not match the amount of timeouts in batch {batch_number} of endpoint {endpoint}. {step} amount of timeouts: {actual}, batch contains {expected}.")]
    CountMismatch {
        endpoint: String,
        batch_number: i64,
        step: BatchStep,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

fn mismatch_message(endpoint: &str, persisted: &RunParameters, requested: &RunParameters) -> String {
    let mut msg = String::from(
        "In progress migration parameters didn't match, either rerun with the abort command or adjust the parameters to match to continue the current migration:\n",
    );
    msg.push_str(&format!("\t'--endpoint': '{}'.\n", endpoint));
    for (key, value) in persisted.iter() {
        msg.push_str(&format!("\t'{}': '{}'.\n", key, value));
    }
    msg.push_str("Requested parameters:\n");
    for (key, value) in requested.iter() {
        msg.push_str(&format!("\t'{}': '{}'.\n", key, value));
    }
    msg
}

fn preflight_message(endpoints: &[EndpointProblems]) -> String {
    let mut msg = String::from("Migration aborted:\n");
    for endpoint in endpoints {
        msg.push_str(&format!("{}:\n", endpoint.endpoint_name));
        for problem in &endpoint.problems {
            msg.push_str(&format!("\t - {}\n", problem));
        }
    }
    msg
}
