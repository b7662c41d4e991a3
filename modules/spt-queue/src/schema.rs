//! Bootstrap for the tables the queue depends on.
//!
//! Production schemas are created by the ingestion pipeline; this exists for
//! tests and fresh development databases. Every statement is idempotent.

use spt_common::{Result, StudySchema};
use sqlx::PgPool;

const BOOTSTRAP_LOCK: &str = "spt schema bootstrap";

/// Create `study_lookup` and the per-study tables in `schema` if absent.
pub async fn ensure_schema(pool: &PgPool, schema: &StudySchema) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS study_lookup (
            study       TEXT PRIMARY KEY,
            schema_name TEXT NOT NULL
        )
        "#
        .to_string(),
        format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.feature_specification (
                identifier        SERIAL PRIMARY KEY,
                derivation_method TEXT   NOT NULL,
                study             TEXT   NOT NULL
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.feature_specifier (
                feature_specification INT  NOT NULL REFERENCES {schema}.feature_specification(identifier),
                specifier             TEXT NOT NULL,
                ordinality            INT  NOT NULL,
                PRIMARY KEY (feature_specification, ordinality)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.quantitative_feature_value (
                feature INT              NOT NULL,
                subject TEXT             NOT NULL,
                value   DOUBLE PRECISION,
                PRIMARY KEY (feature, subject)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.quantitative_feature_value_queue (
                feature           INT       NOT NULL,
                subject           TEXT      NOT NULL,
                computation_start TIMESTAMP,
                retries           INT       NOT NULL DEFAULT 0,
                PRIMARY KEY (feature, subject)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.ondemand_studies_index (
                id            SERIAL PRIMARY KEY,
                specimen      TEXT   NOT NULL,
                blob_type     TEXT   NOT NULL,
                blob_contents BYTEA  NOT NULL
            )
            "#
        ),
    ];

    // Concurrent IF NOT EXISTS creation can still collide in the catalog.
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(BOOTSTRAP_LOCK)
        .execute(&mut *tx)
        .await?;
    for statement in &statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Insert or update a study's row in `study_lookup`.
pub async fn register_study(pool: &PgPool, study: &str, schema: &StudySchema) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO study_lookup (study, schema_name)
        VALUES ($1, $2)
        ON CONFLICT (study) DO UPDATE SET schema_name = EXCLUDED.schema_name
        "#,
    )
    .bind(study)
    .bind(schema.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// All `(study, schema)` pairs in `study_lookup`.
pub async fn study_lookup(pool: &PgPool) -> Result<Vec<(String, StudySchema)>> {
    let rows = sqlx::query_as::<_, (String, String)>(
        r#"
        SELECT study, schema_name
        FROM study_lookup
        ORDER BY study
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(study, schema)| Ok((study, StudySchema::new(schema)?)))
        .collect()
}
