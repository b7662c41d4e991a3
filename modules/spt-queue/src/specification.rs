//! Resolve-or-create for feature specifications.

use spt_common::{FeatureSpecification, Result, StudySchema};
use sqlx::{PgConnection, PgPool};
use tracing::info;

#[derive(Clone)]
pub struct FeatureSpecifications {
    pool: PgPool,
}

impl FeatureSpecifications {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Id of the stored specification equal to `spec`, creating it on first
    /// use. Concurrent callers with equal specifications get the same id.
    pub async fn resolve(
        &self,
        study: &str,
        schema: &StudySchema,
        spec: &FeatureSpecification,
    ) -> Result<i32> {
        let method = spec.class().handle();
        let specifiers = spec.specifiers()?;

        let mut conn = self.pool.acquire().await?;
        if let Some(id) = find(&mut conn, study, schema, method, &specifiers).await? {
            return Ok(id);
        }
        drop(conn);

        let mut tx = self.pool.begin().await?;
        let key = format!("{schema}\t{study}\t{method}\t{}", specifiers.join("\t"));
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&key)
            .execute(&mut *tx)
            .await?;

        if let Some(id) = find(&mut tx, study, schema, method, &specifiers).await? {
            tx.rollback().await?;
            return Ok(id);
        }

        let (id,) = sqlx::query_as::<_, (i32,)>(&format!(
            r#"
            INSERT INTO {schema}.feature_specification (derivation_method, study)
            VALUES ($1, $2)
            RETURNING identifier
            "#
        ))
        .bind(method)
        .bind(study)
        .fetch_one(&mut *tx)
        .await?;

        for (ordinality, specifier) in specifiers.iter().enumerate() {
            sqlx::query(&format!(
                r#"
                INSERT INTO {schema}.feature_specifier (feature_specification, specifier, ordinality)
                VALUES ($1, $2, $3)
                "#
            ))
            .bind(id)
            .bind(specifier)
            .bind(ordinality as i32 + 1)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(study, feature = id, specification = %spec, "Created feature specification");
        Ok(id)
    }

    /// Load a stored specification and the study it belongs to.
    pub async fn load(
        &self,
        schema: &StudySchema,
        feature: i32,
    ) -> Result<Option<(String, FeatureSpecification)>> {
        let header = sqlx::query_as::<_, (String, String)>(&format!(
            r#"
            SELECT derivation_method, study
            FROM {schema}.feature_specification
            WHERE identifier = $1
            "#
        ))
        .bind(feature)
        .fetch_optional(&self.pool)
        .await?;

        let Some((method, study)) = header else {
            return Ok(None);
        };

        let specifiers = sqlx::query_as::<_, (String,)>(&format!(
            r#"
            SELECT specifier
            FROM {schema}.feature_specifier
            WHERE feature_specification = $1
            ORDER BY ordinality
            "#
        ))
        .bind(feature)
        .fetch_all(&self.pool)
        .await?;

        let specifiers: Vec<String> = specifiers.into_iter().map(|(s,)| s).collect();
        let spec = FeatureSpecification::from_persisted(&method, &specifiers)?;
        Ok(Some((study, spec)))
    }
}

async fn find(
    conn: &mut PgConnection,
    study: &str,
    schema: &StudySchema,
    method: &str,
    specifiers: &[String],
) -> Result<Option<i32>> {
    let row = sqlx::query_as::<_, (i32,)>(&format!(
        r#"
        SELECT fs.identifier
        FROM {schema}.feature_specification fs
        WHERE fs.derivation_method = $1
          AND fs.study = $2
          AND COALESCE(
              (
                  SELECT array_agg(specifier ORDER BY ordinality)
                  FROM {schema}.feature_specifier
                  WHERE feature_specification = fs.identifier
              ),
              '{{}}'::text[]
          ) = $3
        ORDER BY fs.identifier
        LIMIT 1
        "#
    ))
    .bind(method)
    .bind(study)
    .bind(specifiers)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(id,)| id))
}
