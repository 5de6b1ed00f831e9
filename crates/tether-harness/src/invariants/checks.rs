//! Standard invariant checks.
//!
//! All of them assume nothing is in flight: run them after
//! `SimServer::exchange` (and a heartbeat if mirrors were dropped).

use std::collections::BTreeSet;

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// Host and remote hold the same set of objects.
///
/// An id only the remote knows is a leaked remote object; an id only the
/// host knows was never instantiated remotely.
pub struct ObjectSetAgreement;

impl Invariant for ObjectSetAgreement {
    fn name(&self) -> &'static str {
        "object_set_agreement"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for session in &state.sessions {
            let host: BTreeSet<&String> = session.host.keys().collect();
            let remote: BTreeSet<&String> = session.remote.keys().collect();
            if host != remote {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "session {}: host only {:?}, remote only {:?}",
                        session.session_id,
                        host.difference(&remote).collect::<Vec<_>>(),
                        remote.difference(&host).collect::<Vec<_>>()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Every syncable value the host holds is the value the remote holds.
pub struct PropertyConvergence;

impl Invariant for PropertyConvergence {
    fn name(&self) -> &'static str {
        "property_convergence"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for session in &state.sessions {
            for (id, host) in &session.host {
                let Some(remote) = session.remote.get(id) else { continue };
                for (name, value) in &host.props {
                    let seen = remote.props.get(name);
                    if seen != Some(value) {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!(
                                "session {} object {id}: {name} is {value} on host but {seen:?} on remote",
                                session.session_id
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// `parent` and `children` describe the same tree on the host.
///
/// If A names P as parent then P lists A, and every child P lists names P
/// as parent.
pub struct TreeConsistency;

impl Invariant for TreeConsistency {
    fn name(&self) -> &'static str {
        "tree_consistency"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for session in &state.sessions {
            for (id, object) in &session.host {
                if let Some(parent) = object.parent() {
                    let listed = session.host.get(parent).is_some_and(|p| p.children().contains(&id.as_str()));
                    if !listed {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!("{id} names parent {parent}, which does not list it"),
                        });
                    }
                }
                for child in object.children() {
                    if session.host.get(child).and_then(|c| c.parent()) != Some(id.as_str()) {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!("{id} lists child {child}, which names another parent"),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::invariants::{ObjectSnapshot, SessionSnapshot};

    fn object(props: &[(&str, serde_json::Value)]) -> ObjectSnapshot {
        ObjectSnapshot {
            class: "Node".into(),
            props: props.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect(),
        }
    }

    fn snapshot(host: BTreeMap<String, ObjectSnapshot>, remote: BTreeMap<String, ObjectSnapshot>) -> SystemSnapshot {
        SystemSnapshot { sessions: vec![SessionSnapshot { session_id: "s".into(), host, remote }] }
    }

    #[test]
    fn divergent_values_are_reported() {
        let host = BTreeMap::from([("Node_1".to_string(), object(&[("value", json!(1))]))]);
        let remote = BTreeMap::from([("Node_1".to_string(), object(&[("value", json!(2))]))]);
        let state = snapshot(host, remote);

        assert!(ObjectSetAgreement.check(&state).is_ok());
        let err = PropertyConvergence.check(&state).unwrap_err();
        assert_eq!(err.invariant, "property_convergence");
    }

    #[test]
    fn leaked_remote_objects_are_reported() {
        let remote = BTreeMap::from([("Node_9".to_string(), object(&[]))]);
        assert!(ObjectSetAgreement.check(&snapshot(BTreeMap::new(), remote)).is_err());
    }

    #[test]
    fn one_sided_tree_links_are_reported() {
        let host = BTreeMap::from([
            ("Node_1".to_string(), object(&[("parent", json!(null)), ("children", json!([]))])),
            ("Node_2".to_string(), object(&[("parent", json!("Node_1")), ("children", json!([]))])),
        ]);
        assert!(TreeConsistency.check(&snapshot(host.clone(), host)).is_err());

        let fixed = BTreeMap::from([
            ("Node_1".to_string(), object(&[("parent", json!(null)), ("children", json!(["Node_2"]))])),
            ("Node_2".to_string(), object(&[("parent", json!("Node_1")), ("children", json!([]))])),
        ]);
        assert!(TreeConsistency.check(&snapshot(fixed.clone(), fixed)).is_ok());
    }
}
