#[cfg(test)]
mod tests {
    use super::super::*;
    use async_trait::async_trait;
    use constraints::{
        ConstraintCatalog, ConstraintDescriptor, ConstraintSuspensionManager, ReferentialAction,
        RestoreAction,
    };
    use error::BackfillError;
    use sea_orm::DbErr;
    use stats::RunStatistics;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    // In-memory catalog recording every call
    #[derive(Default)]
    struct MockCatalog {
        present: Mutex<Vec<ConstraintDescriptor>>,
        fail_drop: Option<String>,
        fail_create: Option<String>,
        created: Mutex<Vec<ConstraintDescriptor>>,
    }

    impl MockCatalog {
        fn with(constraints: Vec<ConstraintDescriptor>) -> Self {
            Self {
                present: Mutex::new(constraints),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ConstraintCatalog for MockCatalog {
        async fn discover(&self, tables: &[&str]) -> Result<Vec<ConstraintDescriptor>, DbErr> {
            Ok(self
                .present
                .lock()
                .unwrap()
                .iter()
                .filter(|c| {
                    tables.contains(&c.table.as_str())
                        || tables.contains(&c.referenced_table.as_str())
                })
                .cloned()
                .collect())
        }

        async fn exists(&self, constraint: &ConstraintDescriptor) -> Result<bool, DbErr> {
            Ok(self
                .present
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.name == constraint.name && c.table == constraint.table))
        }

        async fn drop_constraint(&self, constraint: &ConstraintDescriptor) -> Result<bool, DbErr> {
            if self.fail_drop.as_deref() == Some(constraint.name.as_str()) {
                return Err(DbErr::Custom("lock timeout".to_owned()));
            }
            let mut present = self.present.lock().unwrap();
            let before = present.len();
            present.retain(|c| c.name != constraint.name);
            Ok(present.len() < before)
        }

        async fn create(&self, constraint: &ConstraintDescriptor) -> Result<(), DbErr> {
            if self.fail_create.as_deref() == Some(constraint.name.as_str()) {
                return Err(DbErr::Custom("cannot create".to_owned()));
            }
            self.present.lock().unwrap().push(constraint.clone());
            self.created.lock().unwrap().push(constraint.clone());
            Ok(())
        }
    }

    fn fk(table: &str, name: &str, column: &str, referenced: &str) -> ConstraintDescriptor {
        ConstraintDescriptor {
            table: table.to_owned(),
            name: name.to_owned(),
            columns: vec![column.to_owned()],
            referenced_table: referenced.to_owned(),
            referenced_columns: vec!["id".to_owned()],
            on_delete: ReferentialAction::Cascade,
            on_update: ReferentialAction::NoAction,
        }
    }

    fn partitioned(tables: &[&str]) -> HashSet<String> {
        tables.iter().map(|t| (*t).to_owned()).collect()
    }

    #[tokio::test]
    async fn test_suspend_drops_discovered_constraints() {
        let catalog = Arc::new(MockCatalog::with(vec![
            fk("session_attendees", "fk_attendee_session", "session_id", "sessions"),
            fk("audit_log", "fk_audit_user", "user_id", "user_extensions"),
            fk("unrelated", "fk_other", "x_id", "elsewhere"),
        ]));
        let manager = ConstraintSuspensionManager::new(catalog.clone());
        let mut stats = RunStatistics::default();

        let found = manager.discover(&["sessions", "user_extensions"]).await.unwrap();
        let mut dropped = Vec::new();
        manager.suspend(&found, &mut dropped, &mut stats).await.unwrap();

        assert_eq!(dropped.len(), 2);
        assert_eq!(stats.constraints_dropped, 2);
        let remaining = catalog.present.lock().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "fk_other");
    }

    #[tokio::test]
    async fn test_drop_failure_is_fatal_and_keeps_progress() {
        let catalog = Arc::new(MockCatalog {
            fail_drop: Some("fk_b".to_owned()),
            ..MockCatalog::with(vec![
                fk("feedbacks", "fk_a", "session_id", "sessions"),
                fk("resources", "fk_b", "session_id", "sessions"),
            ])
        });
        let manager = ConstraintSuspensionManager::new(catalog);
        let mut stats = RunStatistics::default();
        let found = manager.discover(&["sessions"]).await.unwrap();
        let mut dropped = Vec::new();

        let err = manager
            .suspend(&found, &mut dropped, &mut stats)
            .await
            .unwrap_err();

        assert!(matches!(err, BackfillError::Constraint { ref constraint, .. } if constraint == "fk_b"));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].name, "fk_a");
    }

    #[tokio::test]
    async fn test_restore_verbatim_when_not_both_partitioned() {
        let original = fk("report_queries", "fk_query_report", "report_id", "reports");
        let catalog = Arc::new(MockCatalog::default());
        let manager = ConstraintSuspensionManager::new(catalog.clone());
        let mut stats = RunStatistics::default();

        let actions = manager
            .restore(&[original.clone()], &partitioned(&["sessions"]), &mut stats)
            .await;

        assert_eq!(actions, vec![RestoreAction::Verbatim]);
        assert_eq!(catalog.created.lock().unwrap()[0], original);
        assert_eq!(stats.constraints_restored, 1);
        assert_eq!(stats.constraints_adapted, 0);
    }

    #[tokio::test]
    async fn test_restore_adapts_known_partitioned_pair() {
        let original = fk("session_attendees", "fk_attendee_session", "session_id", "sessions");
        let catalog = Arc::new(MockCatalog::default());
        let manager = ConstraintSuspensionManager::new(catalog.clone());
        let mut stats = RunStatistics::default();

        let actions = manager
            .restore(
                &[original],
                &partitioned(&["sessions", "session_attendees"]),
                &mut stats,
            )
            .await;

        assert_eq!(actions, vec![RestoreAction::Adapted]);
        let created = catalog.created.lock().unwrap();
        assert_eq!(created[0].columns, vec!["tenant_code", "session_id"]);
        assert_eq!(created[0].referenced_columns, vec!["tenant_code", "id"]);
        assert_eq!(stats.constraints_adapted, 1);
    }

    #[tokio::test]
    async fn test_restore_skips_unknown_partitioned_pair() {
        let original = fk("availabilities", "fk_availability_session", "session_id", "sessions");
        let catalog = Arc::new(MockCatalog::default());
        let manager = ConstraintSuspensionManager::new(catalog.clone());
        let mut stats = RunStatistics::default();

        let actions = manager
            .restore(
                &[original],
                &partitioned(&["sessions", "availabilities"]),
                &mut stats,
            )
            .await;

        assert!(matches!(actions[0], RestoreAction::Skipped(_)));
        assert!(catalog.created.lock().unwrap().is_empty());
        let skipped = &stats.anomalies.skipped_constraints;
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].constraint, "fk_availability_session");
        assert_eq!(skipped[0].referenced_table, "sessions");
    }

    #[tokio::test]
    async fn test_restore_records_create_failure_and_continues() {
        let catalog = Arc::new(MockCatalog {
            fail_create: Some("fk_bad".to_owned()),
            ..MockCatalog::default()
        });
        let manager = ConstraintSuspensionManager::new(catalog.clone());
        let mut stats = RunStatistics::default();

        let actions = manager
            .restore(
                &[
                    fk("forms", "fk_bad", "organization_id", "organization_extension"),
                    fk("issues", "fk_good", "user_id", "user_extensions"),
                ],
                &HashSet::new(),
                &mut stats,
            )
            .await;

        assert!(matches!(actions[0], RestoreAction::Skipped(_)));
        assert_eq!(actions[1], RestoreAction::Verbatim);
        assert_eq!(stats.constraints_restored, 1);
        assert_eq!(stats.anomalies.skipped_constraints.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_leaves_existing_constraint_alone() {
        let existing = fk("forms", "fk_forms_org", "organization_id", "organization_extension");
        let catalog = Arc::new(MockCatalog::with(vec![existing.clone()]));
        let manager = ConstraintSuspensionManager::new(catalog.clone());
        let mut stats = RunStatistics::default();

        let actions = manager.restore(&[existing], &HashSet::new(), &mut stats).await;

        assert_eq!(actions, vec![RestoreAction::AlreadyPresent]);
        assert!(catalog.created.lock().unwrap().is_empty());
    }

    #[test]
    fn test_definition_sql_carries_actions() {
        let sql = fk("feedbacks", "fk_f", "session_id", "sessions").definition_sql();
        assert_eq!(
            sql,
            r#"FOREIGN KEY ("session_id") REFERENCES "sessions" ("id") ON DELETE CASCADE ON UPDATE NO ACTION"#
        );
    }

    #[test]
    fn test_partition_key_is_not_duplicated() {
        let mut c = fk("feedbacks", "fk_f", "session_id", "sessions").with_partition_key();
        c = c.with_partition_key();
        assert_eq!(c.columns, vec!["tenant_code", "session_id"]);
        assert!(c.includes_partition_key());
    }
}
