//! Load expression stores from the `ondemand_studies_index` table.

use std::collections::BTreeMap;

use futures::TryStreamExt;
use spt_common::{PhenotypeCriteria, Result, StudySchema};
use sqlx::PgPool;

use crate::blobs::{StudyBlobs, CENTROIDS, COMPOSITE_PHENOTYPES, EXPRESSIONS_INDEX, FEATURE_MATRIX};
use crate::codec::{encode_centroids, encode_feature_matrix, ExpressionsIndex};
use crate::store::{Point, StudyExpressions};

pub async fn load_study(pool: &PgPool, study: &str, schema: &StudySchema) -> Result<StudyExpressions> {
    let sql = format!(
        r#"
        SELECT specimen, blob_type, blob_contents
        FROM {schema}.ondemand_studies_index
        ORDER BY specimen, blob_type
        "#
    );

    let mut blobs = StudyBlobs::default();
    let mut rows = sqlx::query_as::<_, (String, String, Vec<u8>)>(&sql).fetch(pool);
    while let Some((specimen, blob_type, contents)) = rows.try_next().await? {
        blobs.add(&specimen, &blob_type, contents)?;
    }

    blobs.into_store(study)
}

/// Persist one blob. Used to seed a study's index table.
pub async fn store_blob(
    pool: &PgPool,
    schema: &StudySchema,
    specimen: &str,
    blob_type: &str,
    contents: &[u8],
) -> Result<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO {schema}.ondemand_studies_index (specimen, blob_type, blob_contents)
        VALUES ($1, $2, $3)
        "#
    ))
    .bind(specimen)
    .bind(blob_type)
    .bind(contents)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist a whole store in the blob layout `load_study` reads back.
pub async fn store_study(pool: &PgPool, schema: &StudySchema, store: &StudyExpressions) -> Result<()> {
    let index = ExpressionsIndex::for_channels(store.study(), store.channels());
    store_blob(pool, schema, "", EXPRESSIONS_INDEX, &serde_json::to_vec(&index)?).await?;

    let composites: BTreeMap<&str, &PhenotypeCriteria> = store.composites().collect();
    if !composites.is_empty() {
        store_blob(pool, schema, "", COMPOSITE_PHENOTYPES, &serde_json::to_vec(&composites)?).await?;
    }

    for specimen in store.specimens() {
        let view = store.specimen(specimen)?;
        let matrix: Vec<(u64, u64)> = view.ids.iter().copied().zip(view.rows.iter().copied()).collect();
        let centroids: Vec<(u64, Point)> = view.ids.iter().copied().zip(view.xy.iter().copied()).collect();
        store_blob(pool, schema, specimen, FEATURE_MATRIX, &encode_feature_matrix(&matrix)).await?;
        store_blob(pool, schema, specimen, CENTROIDS, &encode_centroids(&centroids)).await?;
    }
    Ok(())
}
