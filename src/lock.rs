//! Advisory lock protocol over object annotations.
//!
//! Lock state is never stored as a flag: a state object is locked exactly
//! when its lock-id annotation is present and non-empty.  The transitions
//! here are pure; callers fetch a snapshot, run a transition, and commit
//! the resulting annotations with a single store update.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation holding the lock token.
pub const ANNOTATION_LOCK_ID: &str = "tf-kubernetes-configmap-backend.jimmidyson.github.com/lock-id";
/// Annotation holding the Terraform operation label.
pub const ANNOTATION_LOCK_OPERATION: &str =
    "tf-kubernetes-configmap-backend.jimmidyson.github.com/lock-operation";
/// Annotation holding the free-form lock info.
pub const ANNOTATION_LOCK_INFO: &str =
    "tf-kubernetes-configmap-backend.jimmidyson.github.com/lock-info";
/// Annotation holding the lock originator.
pub const ANNOTATION_LOCK_WHO: &str =
    "tf-kubernetes-configmap-backend.jimmidyson.github.com/lock-who";

/// All four reserved keys. They are written and removed together.
pub const LOCK_ANNOTATIONS: [&str; 4] = [
    ANNOTATION_LOCK_ID,
    ANNOTATION_LOCK_OPERATION,
    ANNOTATION_LOCK_INFO,
    ANNOTATION_LOCK_WHO,
];

/// Lock metadata as exchanged with Terraform.
///
/// Terraform sends additional fields (`Version`, `Created`, `Path`); they
/// are accepted and dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Opaque token chosen by the locking client.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Terraform operation, provided by the caller.
    #[serde(rename = "Operation", default)]
    pub operation: String,
    /// Extra information stored with the lock.
    #[serde(rename = "Info", default)]
    pub info: String,
    /// `user@hostname` when available.
    #[serde(rename = "Who", default)]
    pub who: String,
}

impl LockRecord {
    /// Project the four reserved annotations. Missing keys read as empty.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| annotations.get(key).cloned().unwrap_or_default();
        LockRecord {
            id: get(ANNOTATION_LOCK_ID),
            operation: get(ANNOTATION_LOCK_OPERATION),
            info: get(ANNOTATION_LOCK_INFO),
            who: get(ANNOTATION_LOCK_WHO),
        }
    }
}

/// Current lock state of a state object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked(LockRecord),
}

impl LockState {
    /// Derive the state from an object's annotations.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        match annotations.get(ANNOTATION_LOCK_ID) {
            Some(id) if !id.is_empty() => LockState::Locked(LockRecord::from_annotations(annotations)),
            _ => LockState::Unlocked,
        }
    }

    /// Token of the current holder, empty when unlocked.
    pub fn id(&self) -> &str {
        match self {
            LockState::Unlocked => "",
            LockState::Locked(record) => &record.id,
        }
    }

    /// The record reported to a conflicting caller.
    pub fn record(&self) -> LockRecord {
        match self {
            LockState::Unlocked => LockRecord::default(),
            LockState::Locked(record) => record.clone(),
        }
    }

    /// Rewrite the reserved annotations to reflect this state, leaving every
    /// other annotation untouched.
    pub fn apply_to(&self, annotations: &mut BTreeMap<String, String>) {
        match self {
            LockState::Unlocked => {
                for key in LOCK_ANNOTATIONS {
                    annotations.remove(key);
                }
            }
            LockState::Locked(record) => {
                annotations.insert(ANNOTATION_LOCK_ID.to_string(), record.id.clone());
                annotations.insert(ANNOTATION_LOCK_OPERATION.to_string(), record.operation.clone());
                annotations.insert(ANNOTATION_LOCK_INFO.to_string(), record.info.clone());
                annotations.insert(ANNOTATION_LOCK_WHO.to_string(), record.who.clone());
            }
        }
    }
}

/// A request was refused because someone else holds the lock.
///
/// Carries the holder's record, unchanged, for the 423 response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict(pub LockRecord);

/// Take the lock. Re-locking with the holder's own token refreshes the
/// other fields.
pub fn acquire(requested: LockRecord, current: &LockState) -> Result<LockState, LockConflict> {
    match current {
        LockState::Locked(held) if held.id != requested.id => Err(LockConflict(held.clone())),
        _ => Ok(LockState::Locked(requested)),
    }
}

/// Release the lock.
///
/// With a request record, only the holder may release. Without one the
/// release is unconditional when `allow_force` is set, and refused on a
/// locked object otherwise.
pub fn release(
    requested: Option<&LockRecord>,
    current: &LockState,
    allow_force: bool,
) -> Result<LockState, LockConflict> {
    match (requested, current) {
        (_, LockState::Unlocked) => Ok(LockState::Unlocked),
        (Some(req), LockState::Locked(held)) if req.id != held.id => Err(LockConflict(held.clone())),
        (None, LockState::Locked(held)) if !allow_force => Err(LockConflict(held.clone())),
        _ => Ok(LockState::Unlocked),
    }
}

/// Check that a write carries the current lock token.
///
/// An absent token compares as empty, so an unlocked object accepts a
/// write whose token is also empty.
pub fn guard_write(token: Option<&str>, current: &LockState) -> Result<(), LockConflict> {
    if token.unwrap_or("") == current.id() {
        Ok(())
    } else {
        Err(LockConflict(current.record()))
    }
}
