//! The per-field surface editing widgets consume.
//!
//! Widgets depend on [`FieldBinding`] only, never on channels or the
//! session's internals, so the protocol can be swapped or mocked behind it.
//! [`FieldHandle`] layers the focus / input / blur lifecycle of a single
//! widget on top.

use serde_json::Value;
use std::sync::Arc;

use crate::messages::{FieldUpdate, LockHolder};
use crate::update::Resolution;

/// Field-level collaboration operations. Queries never fail.
pub trait FieldBinding: Send + Sync {
    /// Whether someone else holds a live lease on `field`.
    fn is_field_locked(&self, field: &str) -> bool;

    /// Try to lease `field`. `false` means another user holds it.
    fn lock_field(&self, field: &str) -> bool;

    fn unlock_field(&self, field: &str);

    /// Record a local edit and propagate it per the field's emission policy.
    fn broadcast_field_update(&self, field: &str, value: Value);

    /// Holder of a live lease on `field`, the local user included.
    fn get_field_locker(&self, field: &str) -> Option<LockHolder>;

    fn pending_updates(&self) -> Vec<FieldUpdate>;

    fn pending_update(&self, field: &str) -> Option<FieldUpdate> {
        self.pending_updates()
            .into_iter()
            .find(|u| u.field_name == field)
    }

    /// Lock holder and pending update of `field`, read in one consistent view.
    fn field_status(&self, field: &str) -> FieldStatus;

    /// Settle the pending update of `field`. `false` if none was pending.
    fn resolve_conflict(&self, field: &str, resolution: Resolution) -> bool;

    /// Lease `field` and mark it as the one being edited.
    fn begin_edit(&self, field: &str) -> bool;

    /// Commit and broadcast the final value, then release `field`.
    fn end_edit(&self, field: &str, final_value: Value);
}

/// Result of focusing a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusOutcome {
    Editing,
    /// Someone else holds the field; render it read-only.
    ReadOnly { holder: Option<LockHolder> },
}

/// What a widget should render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMode {
    Editable,
    LockedByOther,
    /// A remote value awaits resolution.
    Conflict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldStatus {
    pub held_locally: bool,
    pub holder: Option<LockHolder>,
    pub pending: Option<FieldUpdate>,
}

impl FieldStatus {
    pub fn mode(&self) -> FieldMode {
        if self.pending.is_some() {
            FieldMode::Conflict
        } else if self.holder.is_some() && !self.held_locally {
            FieldMode::LockedByOther
        } else {
            FieldMode::Editable
        }
    }
}

/// Binding of one widget to one field.
#[derive(Clone)]
pub struct FieldHandle {
    binding: Arc<dyn FieldBinding>,
    field: String,
}

impl FieldHandle {
    pub fn new(binding: Arc<dyn FieldBinding>, field: impl Into<String>) -> Self {
        Self {
            binding,
            field: field.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn focus(&self) -> FocusOutcome {
        if self.binding.begin_edit(&self.field) {
            FocusOutcome::Editing
        } else {
            FocusOutcome::ReadOnly {
                holder: self.binding.get_field_locker(&self.field),
            }
        }
    }

    pub fn input(&self, value: Value) {
        self.binding.broadcast_field_update(&self.field, value);
    }

    pub fn blur(&self, final_value: Value) {
        self.binding.end_edit(&self.field, final_value);
    }

    pub fn resolve(&self, resolution: Resolution) -> bool {
        self.binding.resolve_conflict(&self.field, resolution)
    }

    pub fn status(&self) -> FieldStatus {
        self.binding.field_status(&self.field)
    }
}

impl std::fmt::Debug for FieldHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldHandle").field("field", &self.field).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    /// Binding where "carol" holds `locked` and everything else is free.
    #[derive(Default)]
    struct MockBinding {
        calls: Mutex<Vec<String>>,
        pending: Mutex<Vec<FieldUpdate>>,
        mine: Mutex<Option<String>>,
    }

    impl MockBinding {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn carol() -> LockHolder {
            LockHolder {
                user_id: "carol".into(),
                user_email: "carol@example.com".into(),
            }
        }

        fn me() -> LockHolder {
            LockHolder {
                user_id: "me".into(),
                user_email: "me@example.com".into(),
            }
        }
    }

    impl FieldBinding for MockBinding {
        fn is_field_locked(&self, field: &str) -> bool {
            field == "locked"
        }

        fn lock_field(&self, field: &str) -> bool {
            if self.is_field_locked(field) {
                return false;
            }
            *self.mine.lock().unwrap() = Some(field.to_string());
            true
        }

        fn unlock_field(&self, field: &str) {
            let mut mine = self.mine.lock().unwrap();
            if mine.as_deref() == Some(field) {
                *mine = None;
            }
        }

        fn broadcast_field_update(&self, field: &str, value: Value) {
            self.calls.lock().unwrap().push(format!("update {field} {value}"));
        }

        fn get_field_locker(&self, field: &str) -> Option<LockHolder> {
            if field == "locked" {
                Some(Self::carol())
            } else if self.mine.lock().unwrap().as_deref() == Some(field) {
                Some(Self::me())
            } else {
                None
            }
        }

        fn pending_updates(&self) -> Vec<FieldUpdate> {
            self.pending.lock().unwrap().clone()
        }

        fn field_status(&self, field: &str) -> FieldStatus {
            let holder = self.get_field_locker(field);
            FieldStatus {
                held_locally: holder.as_ref().is_some_and(|h| h.user_id == "me"),
                holder,
                pending: self.pending_update(field),
            }
        }

        fn resolve_conflict(&self, field: &str, _resolution: Resolution) -> bool {
            let mut pending = self.pending.lock().unwrap();
            let before = pending.len();
            pending.retain(|u| u.field_name != field);
            before != pending.len()
        }

        fn begin_edit(&self, field: &str) -> bool {
            self.calls.lock().unwrap().push(format!("begin {field}"));
            self.lock_field(field)
        }

        fn end_edit(&self, field: &str, final_value: Value) {
            self.calls.lock().unwrap().push(format!("end {field} {final_value}"));
            self.unlock_field(field);
        }
    }

    #[test]
    fn test_focus_free_field_edits() {
        let mock = Arc::new(MockBinding::default());
        let handle = FieldHandle::new(mock.clone(), "title");

        assert_eq!(handle.focus(), FocusOutcome::Editing);
        let status = handle.status();
        assert!(status.held_locally);
        assert_eq!(status.mode(), FieldMode::Editable);

        handle.input(json!("Hi"));
        handle.blur(json!("Hi there"));
        assert_eq!(
            mock.calls(),
            vec![
                "begin title".to_string(),
                "update title \"Hi\"".to_string(),
                "end title \"Hi there\"".to_string(),
            ]
        );
        assert!(handle.status().holder.is_none());
    }

    #[test]
    fn test_focus_locked_field_is_read_only() {
        let mock = Arc::new(MockBinding::default());
        let handle = FieldHandle::new(mock, "locked");

        assert_eq!(
            handle.focus(),
            FocusOutcome::ReadOnly {
                holder: Some(MockBinding::carol())
            }
        );
        let status = handle.status();
        assert!(!status.held_locally);
        assert_eq!(status.mode(), FieldMode::LockedByOther);
    }

    #[test]
    fn test_pending_update_means_conflict() {
        let mock = Arc::new(MockBinding::default());
        mock.pending.lock().unwrap().push(FieldUpdate {
            field_name: "title".into(),
            field_value: json!("theirs"),
            user_id: "carol".into(),
            updated_at: Utc::now(),
        });
        let handle = FieldHandle::new(mock.clone(), "title");
        handle.focus();

        assert_eq!(handle.status().mode(), FieldMode::Conflict);
        assert!(handle.resolve(Resolution::AcceptTheirs));
        assert!(!handle.resolve(Resolution::AcceptTheirs));
        assert_eq!(handle.status().mode(), FieldMode::Editable);
    }

    #[test]
    fn test_default_pending_update_lookup() {
        let mock = MockBinding::default();
        assert!(mock.pending_update("title").is_none());
    }
}
