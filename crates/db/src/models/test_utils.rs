use std::str::FromStr;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use uuid::Uuid;

use super::project::{CreateProject, Project};

pub async fn setup_test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("invalid sqlite config")
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("failed to open sqlite memory db");

    crate::MIGRATOR
        .run(&pool)
        .await
        .expect("failed to run migrations");

    pool
}

pub async fn test_project(pool: &SqlitePool) -> Project {
    Project::create(
        pool,
        Uuid::new_v4(),
        &CreateProject {
            title: "Test project".to_string(),
            segment_count: 4,
            segment_duration_seconds: 8,
            segment_arcs: vec![
                "setup".into(),
                "rise".into(),
                "peak".into(),
                "outro".into(),
            ],
            supplementary_enabled: true,
        },
    )
    .await
    .expect("create test project")
}
