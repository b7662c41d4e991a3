//! Load expression stores from files.
//!
//! Layout, one directory per study schema:
//!
//! ```text
//! <root>/<schema>/expressions_index.json
//! <root>/<schema>/composite_phenotypes.json      (optional)
//! <root>/<schema>/<specimen>.feature_matrix
//! <root>/<schema>/<specimen>.centroids
//! ```

use std::path::Path;

use spt_common::{Error, Result, StudySchema};
use tokio::fs;

use crate::blobs::{StudyBlobs, CENTROIDS, COMPOSITE_PHENOTYPES, EXPRESSIONS_INDEX, FEATURE_MATRIX};
use crate::store::StudyExpressions;

pub async fn load_study(root: &Path, study: &str, schema: &StudySchema) -> Result<StudyExpressions> {
    let dir = root.join(schema.as_str());
    let mut entries = fs::read_dir(&dir)
        .await
        .map_err(|e| Error::Corrupt(format!("cannot read {}: {e}", dir.display())))?;

    let mut blobs = StudyBlobs::default();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some((specimen, blob_type)) = classify(name) else {
            continue;
        };
        let contents = fs::read(entry.path()).await?;
        blobs.add(specimen, blob_type, contents)?;
    }

    blobs.into_store(study)
}

/// Map a file name to `(specimen, blob type)`.
fn classify(file_name: &str) -> Option<(&str, &'static str)> {
    if file_name == format!("{EXPRESSIONS_INDEX}.json") {
        return Some(("", EXPRESSIONS_INDEX));
    }
    if file_name == format!("{COMPOSITE_PHENOTYPES}.json") {
        return Some(("", COMPOSITE_PHENOTYPES));
    }
    for blob_type in [FEATURE_MATRIX, CENTROIDS] {
        if let Some(specimen) = file_name
            .strip_suffix(blob_type)
            .and_then(|rest| rest.strip_suffix('.'))
        {
            if !specimen.is_empty() {
                return Some((specimen, blob_type));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_map_to_blob_types() {
        assert_eq!(classify("expressions_index.json"), Some(("", EXPRESSIONS_INDEX)));
        assert_eq!(classify("lesion 0_1.feature_matrix"), Some(("lesion 0_1", FEATURE_MATRIX)));
        assert_eq!(classify("lesion 0_1.centroids"), Some(("lesion 0_1", CENTROIDS)));
        assert_eq!(classify(".centroids"), None);
        assert_eq!(classify("README.md"), None);
    }
}
