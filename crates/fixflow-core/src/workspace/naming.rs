//! Deterministic workspace names.
//!
//! `<prefix>/<task-id>-a<attempt>` for the branch, `<task-id>-a<attempt>` for
//! the directory. The task id is a ULID, so names from different tasks never
//! collide; the attempt suffix keeps a task clear of its own abandoned trees.

use crate::domain::TaskId;

pub fn branch_name(prefix: &str, task_id: TaskId, attempt: u32) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        dir_name(task_id, attempt)
    } else {
        format!("{prefix}/{}", dir_name(task_id, attempt))
    }
}

pub fn dir_name(task_id: TaskId, attempt: u32) -> String {
    format!("{task_id}-a{attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case("fixflow", "fixflow/")]
    #[case("fixflow/", "fixflow/")]
    #[case("/bots/fixflow/", "bots/fixflow/")]
    #[case("", "")]
    fn prefix_is_normalised(#[case] prefix: &str, #[case] expected_start: &str) {
        let id = TaskId::from_ulid(Ulid::new());
        let name = branch_name(prefix, id, 1);
        assert_eq!(name, format!("{expected_start}{id}-a1"));
    }

    #[test]
    fn names_are_deterministic_and_attempt_scoped() {
        let id = TaskId::from_ulid(Ulid::new());
        assert_eq!(branch_name("fx", id, 2), branch_name("fx", id, 2));
        assert_ne!(branch_name("fx", id, 1), branch_name("fx", id, 2));
        assert!(dir_name(id, 3).ends_with("-a3"));
    }
}
