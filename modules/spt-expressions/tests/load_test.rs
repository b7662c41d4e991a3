//! Loader tests. The database test requires a Postgres instance: set
//! DATABASE_TEST_URL or it is skipped.

use spt_common::{PhenotypeCriteria, StudySchema};
use spt_expressions::codec::{encode_centroids, encode_feature_matrix, ExpressionsIndex};
use spt_expressions::{db, directory, Cell, Point, StudyExpressions};
use sqlx::PgPool;

const SCHEMA: &str = "spt_expressions_load_test";

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    sqlx::query(&format!("DROP SCHEMA IF EXISTS {SCHEMA} CASCADE"))
        .execute(&pool)
        .await
        .ok()?;
    sqlx::query(&format!("CREATE SCHEMA {SCHEMA}"))
        .execute(&pool)
        .await
        .ok()?;
    sqlx::query(&format!(
        r#"
        CREATE TABLE {SCHEMA}.ondemand_studies_index (
            id            SERIAL PRIMARY KEY,
            specimen      TEXT   NOT NULL,
            blob_type     TEXT   NOT NULL,
            blob_contents BYTEA  NOT NULL
        )
        "#
    ))
    .execute(&pool)
    .await
    .ok()?;

    Some(pool)
}

fn sample_study() -> StudyExpressions {
    let cells = |ids: &[u64]| -> Vec<Cell> {
        ids.iter()
            .map(|&id| Cell {
                id,
                mask: id % 4,
                xy: Point::new(id as f64 * 10.0, 0.5),
            })
            .collect()
    };
    StudyExpressions::builder("Melanoma", vec!["CD3".into(), "CD8".into()])
        .specimen("lesion 1", cells(&[1, 2, 3]))
        .specimen("lesion 2", cells(&[4, 5]))
        .composite(
            "Cytotoxic T cell",
            PhenotypeCriteria::new(["CD3", "CD8"], Vec::<&str>::new()).unwrap(),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn database_blobs_round_trip() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let schema = StudySchema::new(SCHEMA).unwrap();
    let original = sample_study();

    db::store_study(&pool, &schema, &original).await.unwrap();
    let loaded = db::load_study(&pool, "Melanoma", &schema).await.unwrap();

    assert_eq!(loaded.channels(), original.channels());
    assert_eq!(
        loaded.specimens().collect::<Vec<_>>(),
        vec!["lesion 1", "lesion 2"]
    );
    let cells: Vec<_> = loaded.cells("lesion 2").unwrap().collect();
    assert_eq!(cells, vec![(4, Point::new(40.0, 0.5), 0), (5, Point::new(50.0, 0.5), 1)]);
    assert!(loaded.composite("Cytotoxic T cell").is_some());
}

#[tokio::test]
async fn directory_layout_loads() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("melanoma");
    std::fs::create_dir_all(&dir).unwrap();

    let index = ExpressionsIndex::for_channels("m", &["CD3".to_string(), "CD20".to_string()]);
    std::fs::write(dir.join("expressions_index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
    std::fs::write(
        dir.join("s1.feature_matrix"),
        encode_feature_matrix(&[(10, 0b01), (11, 0b10)]),
    )
    .unwrap();
    std::fs::write(
        dir.join("s1.centroids"),
        encode_centroids(&[(10, Point::new(0.0, 0.0)), (11, Point::new(3.0, 4.0))]),
    )
    .unwrap();
    std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

    let schema = StudySchema::new("melanoma").unwrap();
    let store = directory::load_study(root.path(), "Melanoma", &schema)
        .await
        .unwrap();

    assert_eq!(store.study(), "Melanoma");
    let cd20 = PhenotypeCriteria::new(["CD20"], Vec::<&str>::new()).unwrap();
    let result = store.count(&cd20, "s1", None).unwrap();
    assert_eq!((result.count, result.total), (1, 2));
}

#[tokio::test]
async fn missing_directory_is_corrupt() {
    let root = tempfile::tempdir().unwrap();
    let schema = StudySchema::new("absent").unwrap();
    let err = directory::load_study(root.path(), "Absent", &schema)
        .await
        .unwrap_err();
    assert!(matches!(err, spt_common::Error::Corrupt(_)));
}
