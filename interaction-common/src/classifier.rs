//! # Duplicate classifier
//!
//! Turn backend specific database errors into a single "this was a duplicate key" signal, for
//! callers that need insert-or-ignore semantics.
use std::collections::HashMap;

use sqlx::error::DatabaseError;
use sqlx::mysql::MySqlDatabaseError;
use sqlx::sqlite::SqliteError;
use tracing::warn;

/// SQLITE_CONSTRAINT. Extended codes keep it in their low byte.
const SQLITE_CONSTRAINT: i32 = 19;

/// ER_DUP_ENTRY, ER_DUP_UNIQUE and ER_DUP_KEY.
const MYSQL_DUPLICATE_NUMBERS: [u16; 3] = [1062, 1169, 1022];

/// Recognizes duplicate key errors raised by one database driver.
pub trait DuplicateClassifier: Send + Sync {
    /// Returns `true` only if `error` comes from this classifier's driver and reports a duplicate.
    fn is_duplicate(&self, error: &(dyn DatabaseError + 'static)) -> bool;
}

pub fn is_sqlite_constraint_code(code: i32) -> bool {
    code & 0xff == SQLITE_CONSTRAINT
}

pub fn is_mysql_duplicate_number(number: u16) -> bool {
    MYSQL_DUPLICATE_NUMBERS.contains(&number)
}

pub struct SqliteClassifier;

impl DuplicateClassifier for SqliteClassifier {
    fn is_duplicate(&self, error: &(dyn DatabaseError + 'static)) -> bool {
        let Some(sqlite_error) = error.try_downcast_ref::<SqliteError>() else {
            warn!("expected a sqlite error, got: {}", error.message());
            return false;
        };

        sqlite_error
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(is_sqlite_constraint_code)
    }
}

pub struct MySqlClassifier;

impl DuplicateClassifier for MySqlClassifier {
    fn is_duplicate(&self, error: &(dyn DatabaseError + 'static)) -> bool {
        match error.try_downcast_ref::<MySqlDatabaseError>() {
            Some(mysql_error) => is_mysql_duplicate_number(mysql_error.number()),
            None => {
                warn!("expected a mysql error, got: {}", error.message());
                false
            }
        }
    }
}

/// Classifiers registered by backend name at startup.
/// Adding a backend means registering one more classifier, nothing else changes.
#[derive(Default)]
pub struct ClassifierRegistry {
    classifiers: HashMap<String, Box<dyn DuplicateClassifier>>,
}

impl ClassifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry knowing the backends `InteractionStore` can connect to.
    pub fn with_defaults() -> Self {
        Self::new()
            .register("sqlite", Box::new(SqliteClassifier))
            .register("sqlite3", Box::new(SqliteClassifier))
            .register("mysql", Box::new(MySqlClassifier))
    }

    pub fn register(mut self, backend: &str, classifier: Box<dyn DuplicateClassifier>) -> Self {
        self.classifiers.insert(backend.to_owned(), classifier);
        self
    }

    /// Whether `error` raised by `backend` is a duplicate key violation.
    /// Never fails: anything unexpected is logged and reported as not a duplicate.
    pub fn is_duplicate(&self, error: &sqlx::Error, backend: &str) -> bool {
        let Some(classifier) = self.classifiers.get(backend) else {
            warn!("no duplicate classifier registered for backend {}", backend);
            return false;
        };

        match error {
            sqlx::Error::Database(database_error) => classifier.is_duplicate(database_error.as_ref()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    use sqlx::error::ErrorKind;

    use crate::kv::UserProfile;
    use crate::storage::{Backend, InteractionStore};

    /// A database error that belongs to none of the registered drivers.
    #[derive(Debug)]
    struct ForeignError;

    impl fmt::Display for ForeignError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "foreign driver error")
        }
    }

    impl StdError for ForeignError {}

    impl DatabaseError for ForeignError {
        fn message(&self) -> &str {
            "foreign driver error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed("1062"))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    fn foreign_error() -> sqlx::Error {
        sqlx::Error::Database(Box::new(ForeignError))
    }

    #[test]
    fn test_mysql_duplicate_numbers() {
        assert!(is_mysql_duplicate_number(1062));
        assert!(is_mysql_duplicate_number(1169));
        assert!(is_mysql_duplicate_number(1022));
        assert!(!is_mysql_duplicate_number(1234));
        assert!(!is_mysql_duplicate_number(1452));
    }

    #[test]
    fn test_sqlite_constraint_codes() {
        assert!(is_sqlite_constraint_code(19));
        // SQLITE_CONSTRAINT_UNIQUE and SQLITE_CONSTRAINT_PRIMARYKEY.
        assert!(is_sqlite_constraint_code(2067));
        assert!(is_sqlite_constraint_code(1555));
        // SQLITE_BUSY and SQLITE_IOERR_READ.
        assert!(!is_sqlite_constraint_code(5));
        assert!(!is_sqlite_constraint_code(266));
    }

    #[test]
    fn test_unknown_backend_is_not_a_duplicate() {
        let registry = ClassifierRegistry::with_defaults();

        assert!(!registry.is_duplicate(&foreign_error(), "postgres"));
        assert!(!registry.is_duplicate(&foreign_error(), ""));
    }

    #[test]
    fn test_mismatched_error_shape_is_not_a_duplicate() {
        let registry = ClassifierRegistry::with_defaults();

        assert!(!registry.is_duplicate(&foreign_error(), "mysql"));
        assert!(!registry.is_duplicate(&foreign_error(), "sqlite"));
        assert!(!registry.is_duplicate(&sqlx::Error::RowNotFound, "mysql"));
        assert!(!registry.is_duplicate(&sqlx::Error::PoolClosed, "sqlite3"));
    }

    #[test]
    fn test_custom_classifier_can_be_registered() {
        struct AlwaysDuplicate;

        impl DuplicateClassifier for AlwaysDuplicate {
            fn is_duplicate(&self, _: &(dyn DatabaseError + 'static)) -> bool {
                true
            }
        }

        let registry = ClassifierRegistry::new().register("fake", Box::new(AlwaysDuplicate));

        assert!(registry.is_duplicate(&foreign_error(), "fake"));
        assert!(!registry.is_duplicate(&foreign_error(), "mysql"));
    }

    #[tokio::test]
    async fn test_sqlite_primary_key_violation_is_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("dup.db").display());
        let store = InteractionStore::connect(Backend::Sqlite, &url, 1)
            .await
            .unwrap();
        store.migrate().await.unwrap();
        let mut session = store.session().await.unwrap();

        session.insert_user(&UserProfile::new(1)).await.unwrap();
        let error = session
            .insert_user(&UserProfile::new(1))
            .await
            .expect_err("inserting the same user twice should fail");
        let sqlx_error = error.sqlx_error().expect("expected a sqlx error");

        let registry = ClassifierRegistry::with_defaults();
        assert!(registry.is_duplicate(sqlx_error, "sqlite"));
        assert!(registry.is_duplicate(sqlx_error, "sqlite3"));
        // The same error declared as coming from mysql has the wrong shape.
        assert!(!registry.is_duplicate(sqlx_error, "mysql"));

        // Classification is pure: asking again gives the same answer.
        for _ in 0..3 {
            assert!(registry.is_duplicate(sqlx_error, "sqlite"));
        }
    }
}
