//! Process-wide mapping from study name to its expression store and schema.
//!
//! Built once at startup and shared read-only behind an `Arc`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use spt_common::{Error, Result, StudySchema};
use sqlx::PgPool;
use tracing::info;

use crate::store::StudyExpressions;
use crate::{db, directory};

/// Where expression blobs are read from at startup.
#[derive(Debug, Clone)]
pub enum ExpressionSource {
    Database,
    Directory(PathBuf),
}

impl ExpressionSource {
    /// `EXPRESSIONS_DIRECTORY` when set, otherwise the database.
    pub fn from_env() -> Self {
        match std::env::var("EXPRESSIONS_DIRECTORY") {
            Ok(dir) if !dir.trim().is_empty() => ExpressionSource::Directory(PathBuf::from(dir)),
            _ => ExpressionSource::Database,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudyEntry {
    pub schema: StudySchema,
    pub expressions: Arc<StudyExpressions>,
}

#[derive(Debug, Default)]
pub struct StudyRegistry {
    studies: BTreeMap<String, StudyEntry>,
}

impl StudyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_study(mut self, schema: StudySchema, expressions: StudyExpressions) -> Self {
        self.insert(schema, expressions);
        self
    }

    pub fn insert(&mut self, schema: StudySchema, expressions: StudyExpressions) {
        self.studies.insert(
            expressions.study().to_string(),
            StudyEntry {
                schema,
                expressions: Arc::new(expressions),
            },
        );
    }

    pub fn get(&self, study: &str) -> Result<&StudyEntry> {
        self.studies
            .get(study)
            .ok_or_else(|| Error::UnknownStudy(study.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StudyEntry)> {
        self.studies.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// `(study, schema)` pairs in study order.
    pub fn schemas(&self) -> Vec<(String, StudySchema)> {
        self.studies
            .iter()
            .map(|(name, entry)| (name.clone(), entry.schema.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    /// Load every study listed in `study_lookup`.
    pub async fn load(pool: &PgPool, source: &ExpressionSource) -> Result<Self> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT study, schema_name
            FROM study_lookup
            ORDER BY study
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mut registry = Self::new();
        for (study, schema_name) in rows {
            let schema = StudySchema::new(schema_name)?;
            let expressions = match source {
                ExpressionSource::Database => db::load_study(pool, &study, &schema).await?,
                ExpressionSource::Directory(root) => {
                    directory::load_study(root, &study, &schema).await?
                }
            };
            info!(
                study = study.as_str(),
                schema = %schema,
                specimens = expressions.specimens().count(),
                cells = expressions.cell_count(),
                channels = expressions.channels().len(),
                "Loaded expression data"
            );
            registry.insert(schema, expressions);
        }

        Ok(registry)
    }
}
