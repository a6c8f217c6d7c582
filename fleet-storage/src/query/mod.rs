//! Query composition.
//!
//! A [`Query`] is an explicit pipeline builder. Store operations start from
//! an entity-specific base query and fold caller-supplied [`QueryOption`]s
//! over it, in order. The finished query renders two pipelines:
//!
//! - the data pipeline: scope, derived fields, filters, sort, page, joins
//! - the count pipeline: scope, derived fields, filters, count
//!
//! Both are rendered from the same stored stages, so a total count always
//! reflects exactly the filtered set the pages are cut from.

pub mod filter;

pub use filter::{filters_to_expr, tree_to_expr};

use crate::engine::{Expr, Pipeline, SortKey, SortOrder, Stage};
use fleet_core::{FleetResult, Filters, TenantId, ValidationError};
use std::fmt;
use std::sync::Arc;

/// Page size used when a caller asks for less than one item per page.
pub const DEFAULT_PER_PAGE: u64 = 10;

/// Largest page a caller can request.
pub const MAX_PER_PAGE: u64 = 100;

/// Field the count pipeline writes its total into.
pub const COUNT_FIELD: &str = "count";

// ============================================================================
// PAGINATION
// ============================================================================

/// Normalized page request. `page` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paginator {
    pub page: u64,
    pub per_page: u64,
}

impl Paginator {
    /// Normalize raw client input: `page < 1` becomes 1, `per_page < 1`
    /// becomes [`DEFAULT_PER_PAGE`], and `per_page` is capped at
    /// [`MAX_PER_PAGE`].
    pub fn new(page: i64, per_page: i64) -> Self {
        let page = if page < 1 { 1 } else { page as u64 };
        let per_page = if per_page < 1 {
            DEFAULT_PER_PAGE
        } else {
            (per_page as u64).min(MAX_PER_PAGE)
        };
        Self { page, per_page }
    }

    pub fn skip(&self) -> u64 {
        (self.page - 1).saturating_mul(self.per_page)
    }
}

impl Default for Paginator {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

// ============================================================================
// QUERY BUILDER
// ============================================================================

/// Pipeline under construction.
#[derive(Debug, Clone, Default)]
pub struct Query {
    scope: Vec<Expr>,
    derived: Vec<Stage>,
    filters: Vec<Expr>,
    sort: Vec<SortKey>,
    default_sort: Vec<SortKey>,
    tiebreak: Option<String>,
    page: Option<Paginator>,
    joins: Vec<Stage>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the query to a tenant or other ownership scope. Scope
    /// matches run before anything else.
    pub fn scoped(mut self, expr: Expr) -> Self {
        self.scope.push(expr);
        self
    }

    /// Add a stage computing derived fields. Derived stages run before
    /// filters and sort, so clients can filter and sort on them.
    pub fn derive(mut self, stage: Stage) -> Self {
        self.derived.push(stage);
        self
    }

    pub fn matching(mut self, expr: Expr) -> Self {
        self.filters.push(expr);
        self
    }

    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    /// Sort used when no caller sort was supplied.
    pub fn default_sort(mut self, key: SortKey) -> Self {
        self.default_sort.push(key);
        self
    }

    /// Unique field appended to every sort, so pages never overlap.
    pub fn tiebreak(mut self, field: impl Into<String>) -> Self {
        self.tiebreak = Some(field.into());
        self
    }

    pub fn paginate(mut self, page: Paginator) -> Self {
        self.page = Some(page);
        self
    }

    /// Add a late stage. Joins only run for the data pipeline, after
    /// pagination, so they are paid for once per returned row.
    pub fn join(mut self, stage: Stage) -> Self {
        self.joins.push(stage);
        self
    }

    /// Apply options in the order given.
    pub fn apply(self, options: &[QueryOption]) -> FleetResult<Self> {
        options.iter().try_fold(self, |q, opt| opt.apply(q))
    }

    pub fn page(&self) -> Option<Paginator> {
        self.page
    }

    fn push_matches(&self, pipeline: &mut Pipeline) {
        let scope = Expr::and(self.scope.iter().cloned());
        if scope != Expr::True {
            pipeline.push(Stage::Match(scope));
        }
        for stage in &self.derived {
            pipeline.push(stage.clone());
        }
        let filters = Expr::and(self.filters.iter().cloned());
        if filters != Expr::True {
            pipeline.push(Stage::Match(filters));
        }
    }

    fn sort_keys(&self) -> Vec<SortKey> {
        let mut keys = if self.sort.is_empty() {
            self.default_sort.clone()
        } else {
            self.sort.clone()
        };
        if let Some(field) = &self.tiebreak {
            if !keys.iter().any(|k| &k.field == field) {
                keys.push(SortKey::new(field.clone(), SortOrder::Asc));
            }
        }
        keys
    }

    /// Pipeline returning the requested page of documents.
    pub fn data_pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::new();
        self.push_matches(&mut pipeline);
        let keys = self.sort_keys();
        if !keys.is_empty() {
            pipeline.push(Stage::Sort(keys));
        }
        if let Some(page) = self.page {
            pipeline.push(Stage::Skip(page.skip()));
            pipeline.push(Stage::Limit(page.per_page));
        }
        for stage in &self.joins {
            pipeline.push(stage.clone());
        }
        pipeline
    }

    /// Pipeline returning a single `{count: n}` document for the filtered
    /// set, ignoring sort, page and joins.
    pub fn count_pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::new();
        self.push_matches(&mut pipeline);
        pipeline.push(Stage::Count(COUNT_FIELD.to_string()));
        pipeline
    }

    /// Pipeline returning at most one document, with joins.
    pub fn single_pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::new();
        self.push_matches(&mut pipeline);
        pipeline.push(Stage::Limit(1));
        for stage in &self.joins {
            pipeline.push(stage.clone());
        }
        pipeline
    }
}

// ============================================================================
// OPTIONS
// ============================================================================

type OptionFn = dyn Fn(Query) -> FleetResult<Query> + Send + Sync;

/// A pure transformation of a [`Query`].
#[derive(Clone)]
pub struct QueryOption {
    name: &'static str,
    f: Arc<OptionFn>,
}

impl QueryOption {
    pub fn custom(
        name: &'static str,
        f: impl Fn(Query) -> FleetResult<Query> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            f: Arc::new(f),
        }
    }

    /// Page the results. Input is normalized, see [`Paginator::new`].
    pub fn paginate(page: i64, per_page: i64) -> Self {
        let page = Paginator::new(page, per_page);
        Self::custom("paginate", move |q| Ok(q.paginate(page)))
    }

    /// Sort by a field. Repeated sort options add secondary keys.
    pub fn sort(field: impl Into<String>, order: SortOrder) -> Self {
        let field = field.into();
        Self::custom("sort", move |q| {
            validate_field(&field)?;
            Ok(q.sort_by(SortKey::new(field.clone(), order)))
        })
    }

    pub fn match_tenant(tenant_id: impl Into<TenantId>) -> Self {
        let tenant_id = tenant_id.into();
        Self::custom("match_tenant", move |q| {
            Ok(q.scoped(Expr::eq("tenant_id", tenant_id.clone())))
        })
    }

    pub fn match_filters(filters: Filters) -> Self {
        let expr = filters_to_expr(&filters);
        Self::custom("match_filters", move |q| Ok(q.matching(expr.clone())))
    }

    pub fn apply(&self, query: Query) -> FleetResult<Query> {
        (self.f)(query)
    }
}

impl fmt::Debug for QueryOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryOption").field(&self.name).finish()
    }
}

fn validate_field(field: &str) -> Result<(), ValidationError> {
    if field.is_empty() || field.starts_with('$') || field.split('.').any(str::is_empty) {
        return Err(ValidationError::InvalidValue {
            field: "sort".to_string(),
            reason: format!("'{}' is not a sortable field", field),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{FilterTree, PropertyOperator};
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_paginator_normalizes_bounds() {
        assert_eq!(Paginator::new(0, 0), Paginator { page: 1, per_page: 10 });
        assert_eq!(Paginator::new(-3, 5), Paginator { page: 1, per_page: 5 });
        assert_eq!(Paginator::new(2, 1000), Paginator { page: 2, per_page: 100 });
        assert_eq!(Paginator::new(3, 20).skip(), 40);
    }

    #[test]
    fn test_count_pipeline_shares_matches_but_not_page_or_joins() {
        let filters = Filters::new(
            FilterTree::property("name", PropertyOperator::Contains, json!("web")).unwrap(),
        );
        let query = Query::new()
            .join(Stage::Unset(vec!["x".into()]))
            .apply(&[
                QueryOption::match_tenant("t1"),
                QueryOption::match_filters(filters),
                QueryOption::sort("name", SortOrder::Asc),
                QueryOption::paginate(2, 5),
            ])
            .unwrap();

        let data = query.data_pipeline();
        let count = query.count_pipeline();

        let matches = |p: &Pipeline| -> Vec<Stage> {
            p.stages()
                .iter()
                .filter(|s| matches!(s, Stage::Match(_)))
                .cloned()
                .collect()
        };
        assert_eq!(matches(&data), matches(&count));
        assert_eq!(matches(&count).len(), 2);
        assert!(!count
            .stages()
            .iter()
            .any(|s| matches!(s, Stage::Skip(_) | Stage::Limit(_) | Stage::Unset(_))));
        assert!(matches!(count.stages().last(), Some(Stage::Count(_))));
        assert!(data.stages().contains(&Stage::Skip(5)));
        assert!(matches!(data.stages().last(), Some(Stage::Unset(_))));
    }

    #[test]
    fn test_derived_stages_run_before_filters() {
        let derived = Stage::Set {
            field: "online".into(),
            value: crate::engine::Computed::Literal(json!(true)),
        };
        let query = Query::new()
            .derive(derived.clone())
            .matching(Expr::eq("online", true));
        let stages = query.count_pipeline();
        assert_eq!(stages.stages()[0], derived);
    }

    #[test]
    fn test_default_sort_replaced_by_caller_sort() {
        let base = Query::new()
            .default_sort(SortKey::new("priority", SortOrder::Asc))
            .tiebreak("id");
        let default = base.data_pipeline();
        assert_eq!(
            default.stages()[0],
            Stage::Sort(vec![
                SortKey::new("priority", SortOrder::Asc),
                SortKey::new("id", SortOrder::Asc)
            ])
        );

        let custom = base
            .apply(&[QueryOption::sort("username", SortOrder::Desc)])
            .unwrap()
            .data_pipeline();
        assert_eq!(
            custom.stages()[0],
            Stage::Sort(vec![
                SortKey::new("username", SortOrder::Desc),
                SortKey::new("id", SortOrder::Asc)
            ])
        );
    }

    #[test]
    fn test_sort_rejects_operator_fields() {
        let err = Query::new()
            .apply(&[QueryOption::sort("$where", SortOrder::Asc)])
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_options_apply_in_order() {
        let query = Query::new()
            .apply(&[
                QueryOption::paginate(1, 5),
                QueryOption::paginate(3, 7),
            ])
            .unwrap();
        assert_eq!(query.page(), Some(Paginator { page: 3, per_page: 7 }));
    }

    proptest! {
        #[test]
        fn prop_paginator_always_in_bounds(page in any::<i64>(), per_page in any::<i64>()) {
            let p = Paginator::new(page, per_page);
            prop_assert!(p.page >= 1);
            prop_assert!(p.per_page >= 1 && p.per_page <= MAX_PER_PAGE);
        }
    }
}
