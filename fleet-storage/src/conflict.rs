//! Named-field uniqueness checks.
//!
//! Before inserting or renaming, the store asks which of a candidate's
//! unique fields already belong to another document. One query matches any
//! of the fields; each hit is then compared field by field, so the caller
//! learns exactly which fields collide.

use crate::engine::expr::{get_path, values_equal};
use crate::engine::{Collection, Executor, Expr, Pipeline, Stage};
use fleet_core::FleetResult;
use serde_json::Value;

/// Unique fields of a prospective document.
pub trait ConflictCandidate {
    /// `(field, value)` pairs to check. Fields the caller left unset are
    /// omitted.
    fn unique_fields(&self) -> Vec<(&'static str, Value)>;
}

/// Prospective API key identity. `None` fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiKeyCandidate {
    pub id: Option<String>,
    pub name: Option<String>,
}

impl ConflictCandidate for ApiKeyCandidate {
    fn unique_fields(&self) -> Vec<(&'static str, Value)> {
        [("id", &self.id), ("name", &self.name)]
            .into_iter()
            .filter_map(|(field, value)| value.as_deref().map(|v| (field, Value::from(v))))
            .collect()
    }
}

/// Prospective user identity. `None` fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserCandidate {
    pub email: Option<String>,
    pub username: Option<String>,
}

impl ConflictCandidate for UserCandidate {
    fn unique_fields(&self) -> Vec<(&'static str, Value)> {
        [("email", &self.email), ("username", &self.username)]
            .into_iter()
            .filter_map(|(field, value)| value.as_deref().map(|v| (field, Value::from(v))))
            .collect()
    }
}

/// Check `candidate` against `collection`, restricted to `scope`.
///
/// Returns the colliding field names in candidate order, and whether any
/// collided. An empty candidate never conflicts.
pub async fn check_conflicts(
    exec: &dyn Executor,
    collection: Collection,
    scope: Expr,
    candidate: &dyn ConflictCandidate,
) -> FleetResult<(Vec<String>, bool)> {
    let fields = candidate.unique_fields();
    if fields.is_empty() {
        return Ok((Vec::new(), false));
    }

    let any_field = Expr::or(
        fields
            .iter()
            .map(|(name, value)| Expr::Eq(name.to_string(), value.clone())),
    );
    let pipeline = Pipeline::new().with(Stage::Match(Expr::and([scope, any_field])));
    let hits = exec.aggregate(collection, &pipeline).await?;

    let conflicting: Vec<String> = fields
        .iter()
        .filter(|(name, value)| {
            hits.iter()
                .any(|doc| get_path(doc, name).is_some_and(|v| values_equal(v, value)))
        })
        .map(|(name, _)| name.to_string())
        .collect();

    let has_conflict = !conflicting.is_empty();
    Ok((conflicting, has_conflict))
}
