//! Managed-database provisioning through the public service, including the
//! degradation path when the relational admin endpoint is unreachable.

use apex_core::audit;
use apex_core::db::{
    DbError, DbKind, DbServiceConfig, DbState, ManagedDbService, PostgresConfig,
};
use apex_core::metrics;
use apex_core::secrets::{SecretsConfig, SecretsManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn service(base_dir: PathBuf) -> ManagedDbService {
    let secrets = Arc::new(
        SecretsManager::new(
            SecretsConfig {
                master_key: SecretsManager::generate_master_key(),
                iterations: 100_000,
            },
            audit::noop(),
        )
        .unwrap(),
    );

    ManagedDbService::new(
        DbServiceConfig {
            base_dir,
            postgres: PostgresConfig {
                host: "127.0.0.1".to_string(),
                port: 1, // nothing listens here
                connect_timeout: Duration::from_millis(300),
                ..Default::default()
            },
            ..Default::default()
        },
        secrets,
        metrics::noop(),
        audit::noop(),
    )
    .unwrap()
}

#[tokio::test]
async fn relational_with_unreachable_admin_degrades_to_embedded() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path().to_path_buf());

    let db = service
        .create_database(42, 9, DbKind::Relational, "main", None)
        .await
        .unwrap();

    assert_eq!(db.kind, DbKind::Embedded);
    assert_eq!(db.state, DbState::Active);
    let path = db.file_path.expect("embedded instances record a file path");
    assert!(path.ends_with("project_42/main.db"));
    assert!(path.exists());
}

#[tokio::test]
async fn embedded_queries_and_introspection() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path().to_path_buf());

    let db = service
        .create_database(5, 1, DbKind::Embedded, "notes", None)
        .await
        .unwrap();

    let create = service
        .execute_query(
            db.id,
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, created_at DATETIME)",
        )
        .await
        .unwrap();
    assert!(create.is_ok(), "{}", create.error);

    let insert = service
        .execute_query(db.id, "INSERT INTO notes (body) VALUES ('first'), ('second')")
        .await
        .unwrap();
    assert_eq!(insert.affected_rows, 2);

    let select = service
        .execute_query(db.id, "SELECT id, body FROM notes ORDER BY id")
        .await
        .unwrap();
    assert_eq!(select.row_count, 2);
    assert_eq!(select.columns, vec!["id", "body"]);
    assert_eq!(select.rows[0][1], serde_json::json!("first"));

    let tables = service.get_tables(db.id).await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].row_count, 2);

    let schema = service.get_table_schema(db.id, "notes").await.unwrap();
    assert_eq!(schema.len(), 3);

    // Usage counters advance with each query.
    assert!(service.get(db.id).unwrap().usage.queries_total >= 3);
}

#[tokio::test]
async fn query_failure_is_embedded_not_returned() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path().to_path_buf());

    let db = service
        .create_database(5, 1, DbKind::Embedded, "store", None)
        .await
        .unwrap();

    let result = service
        .execute_query(db.id, "SELECT * FROM does_not_exist")
        .await
        .expect("query-time failures do not error the call");
    assert!(!result.is_ok());
    assert!(!result.error.is_empty());
}

#[tokio::test]
async fn hostile_identifiers_rejected_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path().to_path_buf());

    for name in ["drop table--", "a b", "1abc", "x;y", "naïve"] {
        let err = service
            .create_database(1, 1, DbKind::Embedded, name, None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, DbError::InvalidIdentifier(_)),
            "{name:?} must be rejected"
        );
    }

    let db = service
        .create_database(1, 1, DbKind::Embedded, "legit", None)
        .await
        .unwrap();
    assert!(
        service
            .get_table_schema(db.id, "users; DROP TABLE users")
            .await
            .is_err()
    );
}

#[tokio::test]
async fn deletion_is_idempotent_about_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path().to_path_buf());

    let db = service
        .create_database(2, 1, DbKind::Embedded, "gone", None)
        .await
        .unwrap();
    let path = db.file_path.clone().unwrap();

    // Someone removed the file behind our back; deletion still succeeds.
    std::fs::remove_file(&path).unwrap();
    service.delete_database(db.id).await.unwrap();
    assert!(service.get(db.id).is_none());
}

#[tokio::test]
async fn connection_url_shapes() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(dir.path().to_path_buf());

    let db = service
        .create_database(3, 1, DbKind::Embedded, "main", None)
        .await
        .unwrap();
    let url = service.connection_url(db.id).unwrap();
    assert!(url.starts_with("sqlite://"));
    assert!(url.ends_with("project_3/main.db"));
}
