//! Control operations and the dynamic property table.
//!
//! Control clients talk to the daemon over a local SEQPACKET socket; the
//! codec lives in `rudev-daemon`. One request may carry several independent
//! operations, handled in order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One control operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    /// Change the daemon log level (syslog priorities, 0-7) and restart
    /// workers so they inherit it.
    SetLogLevel(u32),
    /// Pause event dispatch.
    StopExecQueue,
    /// Resume event dispatch.
    StartExecQueue,
    /// Drop the cached rules and restart workers.
    Reload,
    /// `"key=value"` sets a property for future workers, `"key="` marks it
    /// as unset.
    SetEnv(String),
    /// Change the worker cap.
    SetChildrenMax(u32),
    /// No-op; the reply itself tells the client the queue was drained.
    Ping,
    /// Begin graceful shutdown. The connection is held open until the
    /// daemon exits, as the acknowledgment the client blocks on.
    Exit,
}

/// Errors from control-operation handling.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Property assignments must contain `=`.
    #[error("invalid key format '{0}'")]
    InvalidKeyFormat(String),
}

/// Result of applying a property assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyChange {
    /// The key now carries a value for future workers.
    Set {
        /// Property key.
        key: String,
        /// Property value.
        value: String,
    },
    /// The key is now marked as unset for future workers.
    Unset {
        /// Property key.
        key: String,
    },
}

/// Dynamic property overrides applied to workers at spawn time.
///
/// `Some(value)` sets the variable in the worker environment, `None`
/// removes it there.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    entries: BTreeMap<String, Option<String>>,
}

impl Properties {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `"key=value"` or `"key="` assignment.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidKeyFormat`] when `=` is missing.
    pub fn apply_assignment(&mut self, assignment: &str) -> Result<PropertyChange, ControlError> {
        let Some((key, value)) = assignment.split_once('=') else {
            return Err(ControlError::InvalidKeyFormat(assignment.to_string()));
        };
        if value.is_empty() {
            self.entries.insert(key.to_string(), None);
            Ok(PropertyChange::Unset {
                key: key.to_string(),
            })
        } else {
            self.entries
                .insert(key.to_string(), Some(value.to_string()));
            Ok(PropertyChange::Set {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
    }

    /// Look up a property override.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Option<String>> {
        self.entries.get(key)
    }

    /// Iterate over all overrides.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Number of overrides.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no overrides are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_unset() {
        let mut props = Properties::new();

        let change = props.apply_assignment("FOO=bar").unwrap();
        assert_eq!(
            change,
            PropertyChange::Set {
                key: "FOO".to_string(),
                value: "bar".to_string()
            }
        );
        assert_eq!(props.get("FOO"), Some(&Some("bar".to_string())));

        let change = props.apply_assignment("FOO=").unwrap();
        assert_eq!(
            change,
            PropertyChange::Unset {
                key: "FOO".to_string()
            }
        );
        assert_eq!(props.get("FOO"), Some(&None));
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_missing_equals_is_rejected() {
        let mut props = Properties::new();
        assert!(matches!(
            props.apply_assignment("FOO"),
            Err(ControlError::InvalidKeyFormat(_))
        ));
        assert!(props.is_empty());
    }

    #[test]
    fn test_control_op_round_trips_through_json() {
        let ops = vec![
            ControlOp::SetLogLevel(7),
            ControlOp::SetEnv("FOO=bar".to_string()),
            ControlOp::SetChildrenMax(4),
            ControlOp::Exit,
        ];
        let json = serde_json::to_string(&ops).unwrap();
        let back: Vec<ControlOp> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ops);
    }
}
