use crate::pulse::query::sort_tokens;
use crate::pulse::types::{ColumnKind, SortDirection, SortField, Token};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUCKET_LIMIT: usize = 10;
pub const DEFAULT_BUCKET_SORT_FIELD: SortField = SortField::Timestamp;
pub const DEFAULT_BUCKET_SORT_DIRECTION: SortDirection = SortDirection::Desc;

/// Overlapping lifecycle partitions of one projection. A token with several
/// flags set appears in each matching bucket.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Buckets {
    pub new_pairs: Vec<Token>,
    pub final_stretch: Vec<Token>,
    pub migrated: Vec<Token>,
}

impl Buckets {
    pub fn get(&self, column: ColumnKind) -> &[Token] {
        match column {
            ColumnKind::NewPairs => &self.new_pairs,
            ColumnKind::FinalStretch => &self.final_stretch,
            ColumnKind::Migrated => &self.migrated,
        }
    }
}

pub fn bucketize(projection: &[Token]) -> Buckets {
    let collect = |column: ColumnKind| -> Vec<Token> {
        projection
            .iter()
            .filter(|token| column.contains(token))
            .cloned()
            .collect()
    };

    Buckets {
        new_pairs: collect(ColumnKind::NewPairs),
        final_stretch: collect(ColumnKind::FinalStretch),
        migrated: collect(ColumnKind::Migrated),
    }
}

/// Bucket-local ordering and row limit, independent of the shared projection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BucketView {
    pub sort_by: SortField,
    pub sort_direction: SortDirection,
    pub limit: usize,
}

impl Default for BucketView {
    fn default() -> Self {
        Self {
            sort_by: DEFAULT_BUCKET_SORT_FIELD,
            sort_direction: DEFAULT_BUCKET_SORT_DIRECTION,
            limit: DEFAULT_BUCKET_LIMIT,
        }
    }
}

impl BucketView {
    pub fn top(&self, tokens: &[Token]) -> Vec<Token> {
        let mut sorted = tokens.to_vec();
        sort_tokens(&mut sorted, self.sort_by, self.sort_direction);
        sorted.truncate(self.limit);
        sorted
    }

    /// Header-click semantics: the active field flips direction, a new field starts descending.
    pub fn toggled(self, field: SortField) -> Self {
        if self.sort_by == field {
            let sort_direction = match self.sort_direction {
                SortDirection::Asc => SortDirection::Desc,
                SortDirection::Desc => SortDirection::Asc,
            };
            Self {
                sort_direction,
                ..self
            }
        } else {
            Self {
                sort_by: field,
                sort_direction: SortDirection::Desc,
                ..self
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::types::tests::sample_token;

    fn ids(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|token| token.id.as_str()).collect()
    }

    #[test]
    fn overlapping_flags_land_in_every_matching_bucket() {
        let mut both = sample_token("both", 1.0);
        both.is_new = true;
        both.is_migrated = true;
        let mut stretch = sample_token("stretch", 2.0);
        stretch.is_final_stretch = true;
        let none = sample_token("none", 3.0);

        let buckets = bucketize(&[both, stretch, none]);

        assert_eq!(ids(&buckets.new_pairs), vec!["both"]);
        assert_eq!(ids(&buckets.migrated), vec!["both"]);
        assert_eq!(ids(buckets.get(ColumnKind::FinalStretch)), vec!["stretch"]);
    }

    #[test]
    fn buckets_keep_projection_order() {
        let tokens: Vec<Token> = ["c", "a", "b"]
            .iter()
            .map(|id| {
                let mut token = sample_token(id, 1.0);
                token.is_new = true;
                token
            })
            .collect();

        assert_eq!(ids(&bucketize(&tokens).new_pairs), vec!["c", "a", "b"]);
    }

    #[test]
    fn view_sorts_and_limits_without_touching_input() {
        let tokens: Vec<Token> = (0..15)
            .map(|index| {
                let mut token = sample_token(&format!("t{index}"), 1.0);
                token.timestamp = index;
                token
            })
            .collect();

        let top = BucketView::default().top(&tokens);

        assert_eq!(top.len(), DEFAULT_BUCKET_LIMIT);
        assert_eq!(top[0].id, "t14");
        assert_eq!(top[9].id, "t5");
        assert_eq!(tokens[0].id, "t0");
    }

    #[test]
    fn toggling_flips_active_field_and_resets_new_field() {
        let view = BucketView::default();
        let flipped = view.toggled(SortField::Timestamp);
        assert_eq!(flipped.sort_direction, SortDirection::Asc);

        let switched = flipped.toggled(SortField::MarketCap);
        assert_eq!(switched.sort_by, SortField::MarketCap);
        assert_eq!(switched.sort_direction, SortDirection::Desc);
        assert_eq!(switched.limit, DEFAULT_BUCKET_LIMIT);
    }
}
