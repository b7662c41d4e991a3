//! Request framing for the metrics service.
//!
//! A request is a list of groups separated by GS (0x1D); each group is a list
//! of tokens separated by RS (0x1E). The first group is the verb. The body
//! ends at FIN. A response is one JSON document followed by EOT (0x04).

use std::collections::HashSet;

use spt_common::{sanitize_token, Error, FeatureClass, PhenotypeCriteria, Result};

pub const GROUP_SEPARATOR: char = '\u{1d}';
pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const END_OF_TRANSMISSION: u8 = 0x04;

const COUNTS: &str = "counts";

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Empty body: per-study channel totals.
    Status,
    /// `counts | study | positives | negatives | [cell ids]`
    Counts {
        study: String,
        criteria: PhenotypeCriteria,
        cell_ids: Option<HashSet<u64>>,
    },
    /// Any asynchronous metric. Radius-bearing classes carry `radius`.
    Metric {
        study: String,
        class: FeatureClass,
        criteria: Vec<PhenotypeCriteria>,
        radius: Option<f64>,
    },
}

impl Request {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let body = std::str::from_utf8(body.trim_ascii())
            .map_err(|_| Error::client("request is not valid UTF-8"))?;
        if body.is_empty() {
            return Ok(Request::Status);
        }

        let groups: Vec<&str> = body.split(GROUP_SEPARATOR).collect();
        let (verb, rest) = groups
            .split_first()
            .ok_or_else(|| Error::client("empty request"))?;

        if *verb == COUNTS {
            return parse_counts(rest);
        }
        let class: FeatureClass = verb.parse()?;
        parse_metric(class, rest)
    }

    /// Frame this request for the wire. Tokens are sanitized so a separator
    /// inside a name becomes a space instead of breaking the framing.
    pub fn encode(&self) -> Vec<u8> {
        let groups: Vec<Vec<String>> = match self {
            Request::Status => Vec::new(),
            Request::Counts {
                study,
                criteria,
                cell_ids,
            } => {
                let mut groups = vec![vec![COUNTS.to_string()], vec![study.clone()]];
                groups.extend(criteria_groups(criteria));
                if let Some(ids) = cell_ids {
                    let mut ids: Vec<u64> = ids.iter().copied().collect();
                    ids.sort_unstable();
                    groups.push(ids.iter().map(u64::to_string).collect());
                }
                groups
            }
            Request::Metric {
                study,
                class,
                criteria,
                radius,
            } => {
                let mut groups = vec![vec![class.handle().to_string()], vec![study.clone()]];
                let radius = radius.map(|r| vec![r.to_string()]);
                if *class == FeatureClass::Proximity {
                    groups.extend(radius.clone());
                }
                for c in criteria {
                    groups.extend(criteria_groups(c));
                }
                if *class == FeatureClass::CoOccurrence {
                    groups.extend(radius);
                }
                groups
            }
        };

        let record = RECORD_SEPARATOR.to_string();
        let group = GROUP_SEPARATOR.to_string();
        groups
            .iter()
            .map(|tokens| {
                tokens
                    .iter()
                    .map(|t| sanitize_token(t))
                    .collect::<Vec<_>>()
                    .join(&record)
            })
            .collect::<Vec<_>>()
            .join(&group)
            .into_bytes()
    }
}

fn criteria_groups(criteria: &PhenotypeCriteria) -> [Vec<String>; 2] {
    [
        criteria.positives().map(str::to_string).collect(),
        criteria.negatives().map(str::to_string).collect(),
    ]
}

fn tokens(group: &str) -> Vec<String> {
    group
        .split(RECORD_SEPARATOR)
        .map(sanitize_token)
        .filter(|token| !token.trim().is_empty())
        .collect()
}

fn criteria(positives: &str, negatives: &str) -> Result<PhenotypeCriteria> {
    PhenotypeCriteria::new(tokens(positives), tokens(negatives))
}

fn study(group: &str) -> Result<String> {
    let study = sanitize_token(group);
    if study.trim().is_empty() {
        return Err(Error::client("study name is empty"));
    }
    Ok(study)
}

fn radius(group: &str) -> Result<f64> {
    group
        .trim()
        .parse()
        .map_err(|_| Error::client(format!("radius must be a number, got {group:?}")))
}

fn parse_counts(groups: &[&str]) -> Result<Request> {
    let (study_group, positives, negatives, cells) = match groups {
        [s, p, n] => (s, p, n, None),
        [s, p, n, c] => (s, p, n, Some(c)),
        _ => {
            return Err(Error::client(format!(
                "counts takes 3 or 4 groups after the verb, got {}",
                groups.len()
            )))
        }
    };

    let cell_ids = match cells.map(|group| tokens(group)) {
        Some(ids) if !ids.is_empty() => Some(
            ids.iter()
                .map(|id| {
                    id.trim()
                        .parse::<u64>()
                        .map_err(|_| Error::client(format!("cell id must be an integer, got {id:?}")))
                })
                .collect::<Result<HashSet<u64>>>()?,
        ),
        _ => None,
    };

    Ok(Request::Counts {
        study: study(study_group)?,
        criteria: criteria(positives, negatives)?,
        cell_ids,
    })
}

fn parse_metric(class: FeatureClass, groups: &[&str]) -> Result<Request> {
    let phenotype_groups = 2 * class.arity();
    let expected = 1 + phenotype_groups + usize::from(class.takes_radius());
    if groups.len() != expected {
        return Err(Error::client(format!(
            "{class} takes {expected} groups after the verb, got {}",
            groups.len()
        )));
    }

    let study = study(groups[0])?;
    let params = &groups[1..];
    let (radius, phenotypes) = match class {
        FeatureClass::Proximity => (Some(radius(params[0])?), &params[1..]),
        FeatureClass::CoOccurrence => {
            let last = params.len() - 1;
            (Some(radius(params[last])?), &params[..last])
        }
        _ => (None, params),
    };

    let criteria = phenotypes
        .chunks(2)
        .map(|pair| criteria(pair[0], pair[1]))
        .collect::<Result<Vec<_>>>()?;

    Ok(Request::Metric {
        study,
        class,
        criteria,
        radius,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(groups: &[&[&str]]) -> Vec<u8> {
        groups
            .iter()
            .map(|tokens| tokens.join("\u{1e}"))
            .collect::<Vec<_>>()
            .join("\u{1d}")
            .into_bytes()
    }

    fn pos(names: &[&str]) -> PhenotypeCriteria {
        PhenotypeCriteria::new(names.iter().copied(), Vec::<&str>::new()).unwrap()
    }

    #[test]
    fn empty_body_is_a_status_request() {
        assert_eq!(Request::parse(b"").unwrap(), Request::Status);
        assert_eq!(Request::parse(b" \n").unwrap(), Request::Status);
    }

    #[test]
    fn counts_with_blank_negatives() {
        let request = Request::parse(&body(&[&["counts"], &["S"], &["CD3", "CD8"], &[""]])).unwrap();
        assert_eq!(
            request,
            Request::Counts {
                study: "S".into(),
                criteria: pos(&["CD3", "CD8"]),
                cell_ids: None,
            }
        );
    }

    #[test]
    fn counts_with_cell_subset() {
        let request =
            Request::parse(&body(&[&["counts"], &["S"], &["CD3"], &["CD8"], &["4", "7"]])).unwrap();
        let Request::Counts { criteria, cell_ids, .. } = request else {
            panic!("expected counts");
        };
        assert_eq!(criteria, PhenotypeCriteria::new(["CD3"], ["CD8"]).unwrap());
        assert_eq!(cell_ids, Some(HashSet::from([4, 7])));
    }

    #[test]
    fn proximity_radius_comes_first() {
        let request = Request::parse(&body(&[
            &["proximity"],
            &["S"],
            &["100"],
            &["CD3"],
            &[""],
            &["CD20"],
            &[""],
        ]))
        .unwrap();
        assert_eq!(
            request,
            Request::Metric {
                study: "S".into(),
                class: FeatureClass::Proximity,
                criteria: vec![pos(&["CD3"]), pos(&["CD20"])],
                radius: Some(100.0),
            }
        );
    }

    #[test]
    fn cooccurrence_radius_comes_last() {
        let request = Request::parse(&body(&[
            &["co-occurrence"],
            &["S"],
            &["CD3"],
            &[""],
            &["CD20"],
            &[""],
            &["25.5"],
        ]))
        .unwrap();
        let Request::Metric { class, radius, .. } = request else {
            panic!("expected metric");
        };
        assert_eq!(class, FeatureClass::CoOccurrence);
        assert_eq!(radius, Some(25.5));
    }

    #[test]
    fn autocorrelation_takes_one_phenotype() {
        let request =
            Request::parse(&body(&[&["spatial autocorrelation"], &["S"], &["CD3"], &[""]])).unwrap();
        let Request::Metric { criteria, radius, .. } = request else {
            panic!("expected metric");
        };
        assert_eq!(criteria, vec![pos(&["CD3"])]);
        assert_eq!(radius, None);
    }

    #[test]
    fn malformed_requests_are_client_errors() {
        let cases: Vec<Vec<u8>> = vec![
            body(&[&["frobnicate"], &["S"]]),
            body(&[&["counts"], &["S"]]),
            body(&[&["proximity"], &["S"], &["wide"], &["A"], &[""], &["B"], &[""]]),
            body(&[&["neighborhood enrichment"], &["S"], &["A"], &[""]]),
            body(&[&["counts"], &["S"], &["A"], &["A"]]),
            body(&[&["counts"], &["S"], &["A"], &[""], &["x"]]),
            vec![0xff, 0xfe],
        ];
        for case in cases {
            let err = Request::parse(&case).unwrap_err();
            assert!(err.is_client_error(), "{err}");
        }
    }

    #[test]
    fn separators_in_names_are_sanitized_on_encode() {
        let request = Request::Counts {
            study: "Study\u{1d}One".into(),
            criteria: PhenotypeCriteria::new(["CD3\u{1e}X"], Vec::<&str>::new()).unwrap(),
            cell_ids: None,
        };
        let parsed = Request::parse(&request.encode()).unwrap();
        let Request::Counts { study, criteria, .. } = parsed else {
            panic!("expected counts");
        };
        assert_eq!(study, "Study One");
        assert_eq!(criteria.positives().collect::<Vec<_>>(), vec!["CD3 X"]);
    }

    #[test]
    fn encoded_metric_parses_back() {
        let request = Request::Metric {
            study: "S".into(),
            class: FeatureClass::CoOccurrence,
            criteria: vec![
                PhenotypeCriteria::new(["CD3"], ["CD20"]).unwrap(),
                PhenotypeCriteria::universal(),
            ],
            radius: Some(40.0),
        };
        assert_eq!(Request::parse(&request.encode()).unwrap(), request);
    }
}
