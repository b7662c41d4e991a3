//! In-memory expression store for one study.
//!
//! Cells are held column-wise (ids, packed channel rows, centroids), grouped
//! contiguously by specimen so each specimen is a cache-sequential slice.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use spt_common::{Error, PhenotypeCriteria, Result};

/// Rows are one machine word wide.
pub const MAX_CHANNELS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_squared(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// A cell as loaded: stable id, channel bits, centroid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub id: u64,
    pub mask: u64,
    pub xy: Point,
}

/// Positive/negative bit masks resolved from a [`PhenotypeCriteria`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CriteriaMask {
    pub positive: u64,
    pub negative: u64,
}

impl CriteriaMask {
    #[inline]
    pub fn matches(&self, row: u64) -> bool {
        row & self.positive == self.positive && row & self.negative == 0
    }
}

/// Matching and total cell counts for one specimen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountResult {
    pub count: u64,
    pub total: u64,
}

/// Borrowed view of one specimen's cells.
#[derive(Debug, Clone, Copy)]
pub struct SpecimenView<'a> {
    pub name: &'a str,
    pub ids: &'a [u64],
    pub rows: &'a [u64],
    pub xy: &'a [Point],
}

impl<'a> SpecimenView<'a> {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn cells(&self) -> impl Iterator<Item = (u64, Point, u64)> + 'a {
        let (ids, xy, rows) = (self.ids, self.xy, self.rows);
        ids.iter()
            .zip(xy)
            .zip(rows)
            .map(|((&id, &xy), &row)| (id, xy, row))
    }

    /// Per-cell match flags for `mask`.
    pub fn indicator(&self, mask: &CriteriaMask) -> Vec<bool> {
        self.rows.iter().map(|&row| mask.matches(row)).collect()
    }
}

#[derive(Debug)]
pub struct StudyExpressions {
    study: String,
    channels: Vec<String>,
    channel_index: HashMap<String, usize>,
    ids: Vec<u64>,
    rows: Vec<u64>,
    xy: Vec<Point>,
    specimens: BTreeMap<String, Range<usize>>,
    composites: BTreeMap<String, PhenotypeCriteria>,
}

impl StudyExpressions {
    pub fn builder(study: impl Into<String>, channels: Vec<String>) -> StudyExpressionsBuilder {
        StudyExpressionsBuilder {
            study: study.into(),
            channels,
            specimens: BTreeMap::new(),
            composites: BTreeMap::new(),
        }
    }

    pub fn study(&self) -> &str {
        &self.study
    }

    /// Channel names in column order.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn specimens(&self) -> impl Iterator<Item = &str> {
        self.specimens.keys().map(String::as_str)
    }

    pub fn cell_count(&self) -> usize {
        self.ids.len()
    }

    pub fn composites(&self) -> impl Iterator<Item = (&str, &PhenotypeCriteria)> {
        self.composites.iter().map(|(name, criteria)| (name.as_str(), criteria))
    }

    pub fn composite(&self, name: &str) -> Option<&PhenotypeCriteria> {
        self.composites.get(name)
    }

    /// Expand a lone composite phenotype name into its definition. Anything
    /// else is returned unchanged.
    pub fn expand_composite(&self, criteria: PhenotypeCriteria) -> PhenotypeCriteria {
        let definition = criteria
            .single_name()
            .filter(|name| !self.channel_index.contains_key(*name))
            .and_then(|name| self.composites.get(name));
        match definition {
            Some(definition) => definition.clone(),
            None => criteria,
        }
    }

    /// Resolve channel names to bit masks.
    pub fn mask_for(&self, criteria: &PhenotypeCriteria) -> Result<CriteriaMask> {
        let mut mask = CriteriaMask::default();
        for name in criteria.positives() {
            mask.positive |= self.channel_bit(name)?;
        }
        for name in criteria.negatives() {
            mask.negative |= self.channel_bit(name)?;
        }
        Ok(mask)
    }

    fn channel_bit(&self, name: &str) -> Result<u64> {
        self.channel_index
            .get(name)
            .map(|&i| 1u64 << i)
            .ok_or_else(|| Error::UnknownChannel {
                study: self.study.clone(),
                channel: name.to_string(),
            })
    }

    pub fn specimen(&self, name: &str) -> Result<SpecimenView<'_>> {
        let (name, range) = self
            .specimens
            .get_key_value(name)
            .ok_or_else(|| Error::client(format!("unknown specimen {name:?} in {}", self.study)))?;
        Ok(SpecimenView {
            name,
            ids: &self.ids[range.clone()],
            rows: &self.rows[range.clone()],
            xy: &self.xy[range.clone()],
        })
    }

    /// Iterate `(id, xy, row)` for a specimen.
    pub fn cells(&self, specimen: &str) -> Result<impl Iterator<Item = (u64, Point, u64)> + '_> {
        Ok(self.specimen(specimen)?.cells())
    }

    /// Count cells matching `criteria` in `specimen`. With a subset, both
    /// numbers are restricted to cells whose id is in it.
    pub fn count(
        &self,
        criteria: &PhenotypeCriteria,
        specimen: &str,
        subset: Option<&HashSet<u64>>,
    ) -> Result<CountResult> {
        let mask = self.mask_for(criteria)?;
        let view = self.specimen(specimen)?;
        Ok(count_masked(&view, &mask, subset))
    }

    /// Number of positive cells per channel across the whole study, in column
    /// order.
    pub fn channel_counts(&self) -> Vec<u64> {
        let mut counts = vec![0u64; self.channels.len()];
        for &row in &self.rows {
            for (i, count) in counts.iter_mut().enumerate() {
                *count += (row >> i) & 1;
            }
        }
        counts
    }
}

pub fn count_masked(
    view: &SpecimenView<'_>,
    mask: &CriteriaMask,
    subset: Option<&HashSet<u64>>,
) -> CountResult {
    let mut result = CountResult { count: 0, total: 0 };
    for (&id, &row) in view.ids.iter().zip(view.rows) {
        if subset.is_some_and(|ids| !ids.contains(&id)) {
            continue;
        }
        result.total += 1;
        if mask.matches(row) {
            result.count += 1;
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct StudyExpressionsBuilder {
    study: String,
    channels: Vec<String>,
    specimens: BTreeMap<String, Vec<Cell>>,
    composites: BTreeMap<String, PhenotypeCriteria>,
}

impl StudyExpressionsBuilder {
    pub fn specimen(mut self, name: impl Into<String>, cells: Vec<Cell>) -> Self {
        self.specimens.insert(name.into(), cells);
        self
    }

    pub fn composite(mut self, name: impl Into<String>, criteria: PhenotypeCriteria) -> Self {
        self.composites.insert(name.into(), criteria);
        self
    }

    pub fn build(self) -> Result<StudyExpressions> {
        if self.channels.len() > MAX_CHANNELS {
            return Err(Error::Corrupt(format!(
                "{} channels exceed the {MAX_CHANNELS}-bit row width",
                self.channels.len()
            )));
        }

        let mut channel_index = HashMap::with_capacity(self.channels.len());
        for (i, name) in self.channels.iter().enumerate() {
            if channel_index.insert(name.clone(), i).is_some() {
                return Err(Error::Corrupt(format!("channel {name:?} listed twice")));
            }
        }

        let unused_bits = match self.channels.len() {
            MAX_CHANNELS => 0,
            n => !((1u64 << n) - 1),
        };

        let total: usize = self.specimens.values().map(Vec::len).sum();
        let mut ids = Vec::with_capacity(total);
        let mut rows = Vec::with_capacity(total);
        let mut xy = Vec::with_capacity(total);
        let mut specimens = BTreeMap::new();
        let mut seen = HashSet::with_capacity(total);

        for (name, cells) in self.specimens {
            let start = ids.len();
            for cell in cells {
                if !seen.insert(cell.id) {
                    return Err(Error::Corrupt(format!(
                        "cell id {} appears more than once in {}",
                        cell.id, self.study
                    )));
                }
                if cell.mask & unused_bits != 0 {
                    return Err(Error::Corrupt(format!(
                        "cell {} sets bits beyond the {} channels",
                        cell.id,
                        self.channels.len()
                    )));
                }
                ids.push(cell.id);
                rows.push(cell.mask);
                xy.push(cell.xy);
            }
            specimens.insert(name, start..ids.len());
        }

        for (name, criteria) in &self.composites {
            for channel in criteria.positives().chain(criteria.negatives()) {
                if !channel_index.contains_key(channel) {
                    return Err(Error::Corrupt(format!(
                        "composite phenotype {name:?} refers to unknown channel {channel:?}"
                    )));
                }
            }
        }

        Ok(StudyExpressions {
            study: self.study,
            channels: self.channels,
            channel_index,
            ids,
            rows,
            xy,
            specimens,
            composites: self.composites,
        })
    }
}
