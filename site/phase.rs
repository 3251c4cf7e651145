//! Round detection.
//!
//! A site process is stateless, so the round is inferred from the request itself: a request
//! carrying no `computation_phase` marker is round one, and a request carrying the aggregator's
//! `remote_1` marker is round two. Markers are honoured at any depth of the request document,
//! which is what existing coordinators send; once the phase is known the request is parsed into
//! a typed [`crate::local::SiteRequest`] and nothing downstream looks at raw JSON again.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Key under which a round marker is carried.
pub const PHASE_KEY: &str = "computation_phase";
/// Marker the aggregator attaches after combining round-one statistics.
pub const REMOTE_ROUND_ONE: &str = "remote_1";
/// Marker this site attaches to its round-one output.
pub const LOCAL_ROUND_ONE: &str = "local_1";
/// Marker this site attaches to its round-two output.
pub const LOCAL_ROUND_TWO: &str = "local_2";

#[derive(Error, Debug, PartialEq)]
pub enum PhaseError {
    #[error("Unrecognized computation phase {found}; a local site only accepts 'remote_1' or no phase at all.")]
    Unrecognized { found: String },
}

/// The round a request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No marker present: compute local betas and build the cache.
    LocalOne,
    /// `remote_1` present: compute residual sums against the global fit.
    LocalTwo,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::LocalOne => f.write_str(LOCAL_ROUND_ONE),
            Phase::LocalTwo => f.write_str(LOCAL_ROUND_TWO),
        }
    }
}

/// Collects every value stored under [`PHASE_KEY`], depth first.
pub fn phase_markers(request: &Value) -> Vec<&Value> {
    let mut found = Vec::new();
    collect_markers(request, &mut found);
    found
}

fn collect_markers<'a>(value: &'a Value, found: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == PHASE_KEY {
                    found.push(child);
                }
                collect_markers(child, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_markers(item, found);
            }
        }
        _ => {}
    }
}

/// Decides which round `request` belongs to.
pub fn detect_phase(request: &Value) -> Result<Phase, PhaseError> {
    let markers = phase_markers(request);
    if markers.is_empty() {
        return Ok(Phase::LocalOne);
    }
    if markers
        .iter()
        .any(|marker| marker.as_str() == Some(REMOTE_ROUND_ONE))
    {
        return Ok(Phase::LocalTwo);
    }
    let found = markers
        .iter()
        .map(|marker| marker.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(PhaseError::Unrecognized { found })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_marker_is_round_one() {
        let request = json!({"input": {"covariates": {}, "data": {}, "lambda": 0.0}, "cache": {}});
        assert_eq!(detect_phase(&request), Ok(Phase::LocalOne));
    }

    #[test]
    fn remote_marker_in_input_is_round_two() {
        let request = json!({"input": {"computation_phase": "remote_1"}, "cache": {}});
        assert_eq!(detect_phase(&request), Ok(Phase::LocalTwo));
    }

    #[test]
    fn remote_marker_is_found_at_any_depth() {
        let request = json!({
            "input": {"site": [{"meta": {"computation_phase": "remote_1"}}]},
            "cache": {}
        });
        assert_eq!(detect_phase(&request), Ok(Phase::LocalTwo));
    }

    #[test]
    fn other_markers_are_protocol_errors() {
        let request = json!({"input": {"computation_phase": "remote_2"}});
        let err = detect_phase(&request).unwrap_err();
        assert_eq!(
            err,
            PhaseError::Unrecognized {
                found: "\"remote_2\"".to_string()
            }
        );
    }

    #[test]
    fn non_string_marker_is_a_protocol_error() {
        let request = json!({"input": {"computation_phase": 1}});
        assert!(detect_phase(&request).is_err());
    }

    #[test]
    fn markers_are_collected_in_document_order() {
        let request = json!({"a": {"computation_phase": "x"}, "b": [{"computation_phase": "y"}]});
        let markers = phase_markers(&request);
        assert_eq!(markers, vec![&json!("x"), &json!("y")]);
    }

    #[test]
    fn phase_displays_as_its_output_marker() {
        assert_eq!(Phase::LocalOne.to_string(), "local_1");
        assert_eq!(Phase::LocalTwo.to_string(), "local_2");
    }
}
