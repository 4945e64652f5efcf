// Postgres storage layer with sqlx
//
// `Database` is the repository facade; `stores` implements the core's
// SessionStore/ToolStore/TemplateStore traits against it. All session and
// instance state transitions are compare-and-set, and each agent-loop step
// commits in one transaction.

pub mod models;
pub mod repositories;
pub mod stores;

pub use models::*;
pub use repositories::{Database, NewInstance, NewTool, ReleaseOutcome};

#[cfg(test)]
mod tests {
    use super::repositories::map_sqlx;
    use perpetua_core::RuntimeError;

    #[test]
    fn pool_errors_are_transient() {
        assert!(matches!(
            map_sqlx(sqlx::Error::PoolTimedOut),
            RuntimeError::TransientStore(_)
        ));
        assert!(matches!(
            map_sqlx(sqlx::Error::PoolClosed),
            RuntimeError::TransientStore(_)
        ));
    }

    #[test]
    fn row_not_found_is_permanent() {
        assert!(matches!(
            map_sqlx(sqlx::Error::RowNotFound),
            RuntimeError::Store(_)
        ));
    }
}
