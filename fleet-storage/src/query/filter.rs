//! Translation of client filter trees into engine expressions.

use crate::engine::Expr;
use fleet_core::{Condition, FilterTree, Filters, LogicalOperator};
use serde_json::Value;

/// Expression equivalent to a filter tree.
pub fn tree_to_expr(tree: &FilterTree) -> Expr {
    match tree {
        FilterTree::Property { name, condition } => match condition {
            Condition::Contains(needle) => Expr::Contains(name.clone(), needle.clone()),
            Condition::ContainsAll(values) => Expr::All(name.clone(), values.clone()),
            Condition::Eq(value) => Expr::Eq(name.clone(), value.clone()),
            Condition::Bool(b) => Expr::Eq(name.clone(), Value::Bool(*b)),
            Condition::Gt(n) => Expr::Gt(name.clone(), Value::from(*n)),
        },
        FilterTree::Logical {
            operator,
            left,
            right,
        } => {
            let (l, r) = (tree_to_expr(left), tree_to_expr(right));
            match operator {
                LogicalOperator::And => Expr::and([l, r]),
                LogicalOperator::Or => Expr::or([l, r]),
            }
        }
    }
}

/// Expression for a possibly empty filter set. Empty filters match all.
pub fn filters_to_expr(filters: &Filters) -> Expr {
    filters.root().map_or(Expr::True, tree_to_expr)
}
