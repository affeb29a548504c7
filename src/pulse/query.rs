use crate::pulse::types::{FilterState, SortDirection, SortField, Token};
use std::cmp::Ordering;

enum SortValue<'a> {
    Number(f64),
    Text(&'a str),
    Unsupported,
}

fn sort_value(token: &Token, field: SortField) -> SortValue<'_> {
    match field {
        SortField::Id => SortValue::Text(&token.id),
        SortField::Symbol => SortValue::Text(&token.symbol),
        SortField::Name => SortValue::Text(&token.name),
        SortField::Price => SortValue::Number(token.price),
        SortField::PriceChange24h => SortValue::Number(token.price_change_24h),
        SortField::Volume24h => SortValue::Number(token.volume_24h),
        SortField::MarketCap => SortValue::Number(token.market_cap),
        SortField::Liquidity => SortValue::Number(token.liquidity),
        SortField::HolderCount => SortValue::Number(token.holder_count as f64),
        SortField::Timestamp => SortValue::Number(token.timestamp as f64),
        SortField::Unsupported => SortValue::Unsupported,
    }
}

/// Case-insensitive code point ordering; lowercase sorts first when two
/// strings differ only by case. Accents are not folded, so `é` sorts after `z`.
pub fn collate(left: &str, right: &str) -> Ordering {
    left.chars()
        .flat_map(char::to_lowercase)
        .cmp(right.chars().flat_map(char::to_lowercase))
        .then_with(|| right.cmp(left))
}

/// Pairs that cannot be compared are equal, so a stable sort leaves them in place.
pub fn compare_by(
    left: &Token,
    right: &Token,
    field: SortField,
    direction: SortDirection,
) -> Ordering {
    let ordering = match (sort_value(left, field), sort_value(right, field)) {
        (SortValue::Number(a), SortValue::Number(b)) => {
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (SortValue::Text(a), SortValue::Text(b)) => collate(a, b),
        _ => Ordering::Equal,
    };

    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

/// Stable: ties keep their input order in both directions.
pub fn sort_tokens(tokens: &mut [Token], field: SortField, direction: SortDirection) {
    tokens.sort_by(|left, right| compare_by(left, right, field, direction));
}

fn matches_search(token: &Token, needle: Option<&str>) -> bool {
    let Some(needle) = needle else {
        return true;
    };
    token.symbol.to_lowercase().contains(needle) || token.name.to_lowercase().contains(needle)
}

pub fn matches_filters(token: &Token, filters: &FilterState, needle: Option<&str>) -> bool {
    matches_search(token, needle)
        && filters.price_range.contains(token.price)
        && filters.volume_range.contains(token.volume_24h)
        && (filters.columns.is_empty() || token.has_any_column(&filters.columns))
}

pub fn project(entities: &[Token], filters: &FilterState) -> Vec<Token> {
    let needle = (!filters.search.is_empty()).then(|| filters.search.to_lowercase());
    let mut projected: Vec<Token> = entities
        .iter()
        .filter(|token| matches_filters(token, filters, needle.as_deref()))
        .cloned()
        .collect();

    sort_tokens(&mut projected, filters.sort_by, filters.sort_direction);
    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::types::tests::sample_token;
    use crate::pulse::types::{ColumnKind, NumericRange};

    fn ids(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|token| token.id.as_str()).collect()
    }

    fn mixed_tokens() -> Vec<Token> {
        let mut alpha = sample_token("alpha", 5.0);
        alpha.name = "Alpha Whale".to_string();
        alpha.volume_24h = 10.0;
        alpha.is_new = true;

        let mut beta = sample_token("beta", 50.0);
        beta.symbol = "BOGE".to_string();
        beta.volume_24h = 500.0;
        beta.is_migrated = true;

        let mut gamma = sample_token("gamma", 500.0);
        gamma.volume_24h = 5_000.0;
        gamma.is_final_stretch = true;
        gamma.is_migrated = true;

        vec![alpha, beta, gamma]
    }

    #[test]
    fn default_filters_return_every_entity() {
        let tokens = mixed_tokens();
        let projected = project(&tokens, &FilterState::default());
        assert_eq!(ids(&projected), vec!["gamma", "beta", "alpha"]);
    }

    #[test]
    fn collate_ignores_case_but_not_accents() {
        assert_eq!(collate("alpha", "BETA"), Ordering::Less);
        assert_eq!(collate("Zed", "zed"), Ordering::Greater);
        assert_eq!(collate("zulu", "\u{e9}clair"), Ordering::Less);
    }

    #[test]
    fn empty_input_projects_to_empty_output() {
        assert!(project(&[], &FilterState::default()).is_empty());
    }

    #[test]
    fn search_matches_symbol_or_name_case_insensitively() {
        let tokens = mixed_tokens();
        let filters = FilterState {
            search: "whALE".to_string(),
            ..FilterState::default()
        };
        assert_eq!(ids(&project(&tokens, &filters)), vec!["alpha"]);

        let filters = FilterState {
            search: "boge".to_string(),
            ..FilterState::default()
        };
        assert_eq!(ids(&project(&tokens, &filters)), vec!["beta"]);
    }

    #[test]
    fn ranges_are_inclusive_on_both_ends() {
        let tokens = mixed_tokens();
        let filters = FilterState {
            price_range: NumericRange::new(5.0, 50.0),
            volume_range: NumericRange::new(10.0, 500.0),
            ..FilterState::default()
        };
        assert_eq!(ids(&project(&tokens, &filters)), vec!["beta", "alpha"]);
    }

    #[test]
    fn columns_use_any_flag_membership() {
        let tokens = mixed_tokens();
        let filters = FilterState {
            columns: vec![ColumnKind::Migrated],
            ..FilterState::default()
        };
        assert_eq!(ids(&project(&tokens, &filters)), vec!["gamma", "beta"]);

        let filters = FilterState {
            columns: vec![ColumnKind::NewPairs, ColumnKind::FinalStretch],
            ..FilterState::default()
        };
        assert_eq!(ids(&project(&tokens, &filters)), vec!["gamma", "alpha"]);
    }

    #[test]
    fn empty_columns_do_not_restrict() {
        let mut tokens = mixed_tokens();
        tokens.push(sample_token("flagless", 1.0));
        let filters = FilterState {
            columns: Vec::new(),
            ..FilterState::default()
        };
        assert_eq!(project(&tokens, &filters).len(), 4);

        let projected = project(&tokens, &FilterState::default());
        assert!(!ids(&projected).contains(&"flagless"));
    }

    #[test]
    fn sort_is_stable_for_ties_in_both_directions() {
        let tokens = vec![
            sample_token("first", 7.0),
            sample_token("low", 1.0),
            sample_token("second", 7.0),
            sample_token("third", 7.0),
        ];

        let mut ascending = tokens.clone();
        sort_tokens(&mut ascending, SortField::Price, SortDirection::Asc);
        assert_eq!(ids(&ascending), vec!["low", "first", "second", "third"]);

        let mut descending = tokens;
        sort_tokens(&mut descending, SortField::Price, SortDirection::Desc);
        assert_eq!(ids(&descending), vec!["first", "second", "third", "low"]);
    }

    #[test]
    fn unsupported_sort_field_keeps_input_order() {
        let tokens = mixed_tokens();
        let filters = FilterState {
            sort_by: SortField::Unsupported,
            ..FilterState::default()
        };
        assert_eq!(ids(&project(&tokens, &filters)), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn text_fields_sort_case_insensitively() {
        let mut lower = sample_token("one", 1.0);
        lower.symbol = "sol".to_string();
        let mut upper = sample_token("two", 1.0);
        upper.symbol = "SOL".to_string();
        let mut bitcoin = sample_token("three", 1.0);
        bitcoin.symbol = "BTC".to_string();

        let mut tokens = vec![upper, lower, bitcoin];
        sort_tokens(&mut tokens, SortField::Symbol, SortDirection::Asc);
        assert_eq!(ids(&tokens), vec!["three", "one", "two"]);
    }
}
