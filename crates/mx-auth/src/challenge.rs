//! The shape of a homeserver's 401 UIA challenge body, and what the request
//! callback is allowed to fail with.

use std::collections::HashMap;

use serde_json::Value;

use mx_core::MxError;

/// `{errcode, error}` carried by the last failed stage attempt, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub errcode: Option<String>,
    pub error: Option<String>,
}

/// The body of an HTTP 401 response describing remaining UIA stages.
#[derive(Debug, Clone)]
pub struct UiaChallenge {
    pub flows: Vec<Vec<String>>,
    pub completed: Vec<String>,
    pub params: HashMap<String, Value>,
    pub session: String,
    pub errcode: Option<String>,
    pub error: Option<String>,
}

impl UiaChallenge {
    pub(crate) fn stage_error(&self) -> Option<StageError> {
        if self.errcode.is_none() && self.error.is_none() {
            return None;
        }
        Some(StageError {
            errcode: self.errcode.clone(),
            error: self.error.clone(),
        })
    }

    /// First advertised flow, per spec: flow selection does not negotiate —
    /// it just takes `flows[0]`.
    pub(crate) fn chosen_flow(&self) -> mx_core::Result<&[String]> {
        self.flows.first().map(Vec::as_slice).ok_or(MxError::NoIncompleteFlows)
    }

    /// First stage of the chosen flow not already in `completed`.
    pub(crate) fn next_stage(&self) -> mx_core::Result<String> {
        let flow = self.chosen_flow()?;
        flow.iter()
            .find(|stage| !self.completed.contains(stage))
            .cloned()
            .ok_or(MxError::NoIncompleteFlows)
    }
}

/// What the caller-supplied request callback can fail with. A UIA challenge
/// is not a terminal failure — the driver consumes it and continues.
pub enum DoRequestError {
    Uia(UiaChallenge),
    Other(MxError),
}
