use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

/// One unit of work: a feature evaluated on one specimen of one study.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobReference {
    pub feature: i32,
    pub study: String,
    pub specimen: String,
}

impl JobReference {
    pub fn new(feature: i32, study: impl Into<String>, specimen: impl Into<String>) -> Self {
        Self {
            feature,
            study: study.into(),
            specimen: specimen.into(),
        }
    }
}

impl fmt::Display for JobReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.feature, self.study, self.specimen)
    }
}

static RE_SCHEMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("valid regex"));

/// A validated Postgres schema name holding one study's tables.
///
/// Only lowercase identifiers are accepted, so the name can be interpolated
/// into SQL without quoting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StudySchema(String);

impl StudySchema {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if RE_SCHEMA.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(Error::Corrupt(format!("invalid study schema name {name:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_are_plain_identifiers() {
        assert!(StudySchema::new("melanoma_2023").is_ok());
        assert!(StudySchema::new("_scratch").is_ok());
        assert!(StudySchema::new("Melanoma").is_err());
        assert!(StudySchema::new("a; DROP TABLE x").is_err());
        assert!(StudySchema::new("1abc").is_err());
        assert!(StudySchema::new("").is_err());
    }

    #[test]
    fn job_display_is_a_triple() {
        let job = JobReference::new(7, "Melanoma", "lesion 0_1");
        assert_eq!(job.to_string(), "(7, Melanoma, lesion 0_1)");
    }
}
