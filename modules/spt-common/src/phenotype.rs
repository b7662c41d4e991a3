//! Phenotype criteria: "positive for every channel in P, negative for every
//! channel in N".

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const GROUP_SEPARATOR: char = '\u{1d}';
const RECORD_SEPARATOR: char = '\u{1e}';

/// Replace the wire separators with spaces so a token can never break
/// group/record framing.
pub fn sanitize_token(token: &str) -> String {
    token.replace([GROUP_SEPARATOR, RECORD_SEPARATOR], " ")
}

/// An unordered pair of disjoint channel-name sets.
///
/// Blank names are dropped, so an empty side places no constraint on a cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "RawCriteria", into = "RawCriteria")]
pub struct PhenotypeCriteria {
    positives: BTreeSet<String>,
    negatives: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
struct RawCriteria {
    #[serde(default)]
    positive: Vec<String>,
    #[serde(default)]
    negative: Vec<String>,
}

impl TryFrom<RawCriteria> for PhenotypeCriteria {
    type Error = Error;

    fn try_from(raw: RawCriteria) -> Result<Self> {
        Self::new(raw.positive, raw.negative)
    }
}

impl From<PhenotypeCriteria> for RawCriteria {
    fn from(criteria: PhenotypeCriteria) -> Self {
        Self {
            positive: criteria.positives.into_iter().collect(),
            negative: criteria.negatives.into_iter().collect(),
        }
    }
}

impl PhenotypeCriteria {
    pub fn new<P, N>(positives: P, negatives: N) -> Result<Self>
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        N: IntoIterator,
        N::Item: AsRef<str>,
    {
        let positives = clean(positives);
        let negatives = clean(negatives);

        if let Some(both) = positives.intersection(&negatives).next() {
            return Err(Error::client(format!(
                "channel \"{both}\" is both positive and negative"
            )));
        }

        Ok(Self {
            positives,
            negatives,
        })
    }

    /// Criteria matching every cell.
    pub fn universal() -> Self {
        Self::default()
    }

    pub fn positives(&self) -> impl Iterator<Item = &str> {
        self.positives.iter().map(String::as_str)
    }

    pub fn negatives(&self) -> impl Iterator<Item = &str> {
        self.negatives.iter().map(String::as_str)
    }

    pub fn is_universal(&self) -> bool {
        self.positives.is_empty() && self.negatives.is_empty()
    }

    /// A lone positive name with no negatives, the shape used to refer to a
    /// named composite phenotype.
    pub fn single_name(&self) -> Option<&str> {
        if self.negatives.is_empty() && self.positives.len() == 1 {
            self.positives.iter().next().map(String::as_str)
        } else {
            None
        }
    }
}

impl fmt::Display for PhenotypeCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (names, sign) in [(&self.positives, '+'), (&self.negatives, '-')] {
            for name in names {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{name}{sign}")?;
                first = false;
            }
        }
        if first {
            write!(f, "(all cells)")?;
        }
        Ok(())
    }
}

fn clean<I>(names: I) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| sanitize_token(name.as_ref()).trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
