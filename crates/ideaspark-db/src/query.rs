//! Filters and aggregation pipelines, compiled to SQLite.
//!
//! A pipeline compiles to nested `SELECT`s. Stages are folded into the current
//! select level while doing so preserves their meaning; a stage that would
//! change meaning (a `$match` after a `$limit`, say) closes the level and
//! wraps it as the source of the next one.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use ideaspark_types::pagination::SortOrder;

use crate::collections::{Collection, Column, IS_DELETED_SQL, Relation};
use crate::{DbError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Self::And(vec![])
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    pub fn one_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In(field.into(), values)
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Sort(Vec<SortKey>),
    Skip(u64),
    Limit(u64),
    /// Resolve a declared relation into the document under its key.
    Lookup(String),
    /// Keep only these keys (identity is always kept).
    Project(Vec<String>),
}

/// Which rows a read sees with respect to soft deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Deleted {
    #[default]
    Exclude,
    Include,
    Only,
}

/// A plain find: filter, optional projection, relations to resolve.
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub filter: Option<Filter>,
    pub projection: Option<Vec<String>>,
    pub joins: Vec<String>,
    pub deleted: Deleted,
}

impl FindQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Default::default()
        }
    }

    pub fn select<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn join(mut self, relation: impl Into<String>) -> Self {
        self.joins.push(relation.into());
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.deleted = Deleted::Include;
        self
    }

    pub fn only_deleted(mut self) -> Self {
        self.deleted = Deleted::Only;
        self
    }

    /// The equivalent pipeline, so finds and aggregations share one compiler.
    pub fn to_pipeline(&self) -> Pipeline {
        let mut stages = Vec::new();
        if let Some(filter) = &self.filter {
            stages.push(Stage::Match(filter.clone()));
        }
        if let Some(keys) = &self.projection {
            stages.push(Stage::Project(keys.clone()));
        }
        stages.extend(self.joins.iter().cloned().map(Stage::Lookup));
        Pipeline {
            stages,
            deleted: self.deleted,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
    pub deleted: Deleted,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(mut self, filter: Filter) -> Self {
        self.stages.push(Stage::Match(filter));
        self
    }

    pub fn sort(mut self, keys: Vec<SortKey>) -> Self {
        self.stages.push(Stage::Sort(keys));
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.stages.push(Stage::Skip(n));
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.stages.push(Stage::Limit(n));
        self
    }

    pub fn lookup(mut self, relation: impl Into<String>) -> Self {
        self.stages.push(Stage::Lookup(relation.into()));
        self
    }

    pub fn project<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages
            .push(Stage::Project(keys.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.deleted = Deleted::Include;
        self
    }
}

/// Output of the compiler: a `SELECT` over every column of the collection,
/// its bound parameters in textual order, and the post-fetch work.
#[derive(Debug)]
pub struct Compiled {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub projection: Option<Vec<&'static Column>>,
    pub lookups: Vec<&'static Relation>,
}

#[derive(Default)]
struct Level {
    wheres: Vec<String>,
    order: Vec<(&'static Column, SortOrder)>,
    limit: Option<u64>,
    offset: u64,
}

impl Level {
    fn is_windowed(&self) -> bool {
        self.limit.is_some() || self.offset > 0
    }

    fn render(&self, columns: &str, source: &str) -> String {
        let mut sql = format!("SELECT {} FROM {}", columns, source);
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.wheres.join(" AND "));
        }
        if !self.order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_clause(&self.order, None));
        }
        match (self.limit, self.offset) {
            (Some(limit), 0) => sql.push_str(&format!(" LIMIT {}", limit)),
            (Some(limit), offset) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (None, 0) => {}
            (None, offset) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
        }
        sql
    }
}

pub fn column_list(columns: &[&'static Column], alias: Option<&str>) -> String {
    columns
        .iter()
        .map(|c| match alias {
            Some(a) => format!("{}.{}", a, c.quoted()),
            None => c.quoted(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn order_clause(order: &[(&'static Column, SortOrder)], alias: Option<&str>) -> String {
    order
        .iter()
        .map(|(c, o)| match alias {
            Some(a) => format!("{}.{} {}", a, c.quoted(), o.as_sql()),
            None => format!("{} {}", c.quoted(), o.as_sql()),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolve sort keys, appending identity as the tiebreaker so ordering is
/// total and deterministic.
pub fn resolve_order(
    collection: &'static Collection,
    keys: &[SortKey],
) -> Result<Vec<(&'static Column, SortOrder)>> {
    let mut order = Vec::with_capacity(keys.len() + 1);
    for key in keys {
        order.push((collection.column(&key.field)?, key.order));
    }
    let id = collection.id_column();
    if !order.iter().any(|(c, _)| std::ptr::eq(*c, id)) {
        let tiebreak = order.last().map(|(_, o)| *o).unwrap_or(SortOrder::Asc);
        order.push((id, tiebreak));
    }
    Ok(order)
}

pub fn compile(collection: &'static Collection, pipeline: &Pipeline) -> Result<Compiled> {
    let all: Vec<&'static Column> = collection.columns.iter().collect();
    let columns = column_list(&all, None);

    let mut params = Vec::new();
    let mut source = format!("\"{}\"", collection.table);
    let mut level = Level::default();
    let mut depth = 0;
    let mut projection = None;
    let mut lookups: Vec<&'static Relation> = Vec::new();

    match pipeline.deleted {
        Deleted::Exclude => level.wheres.push(format!("\"{}\" = 0", IS_DELETED_SQL)),
        Deleted::Only => level.wheres.push(format!("\"{}\" = 1", IS_DELETED_SQL)),
        Deleted::Include => {}
    }

    for stage in &pipeline.stages {
        let wrap = match stage {
            Stage::Match(_) | Stage::Sort(_) => level.is_windowed(),
            Stage::Skip(_) => level.limit.is_some(),
            _ => false,
        };
        if wrap {
            depth += 1;
            source = format!("({}) AS s{}", level.render(&columns, &source), depth);
            level = Level::default();
        }

        match stage {
            Stage::Match(filter) => {
                let clause = compile_filter(collection, filter, &mut params)?;
                level.wheres.push(clause);
            }
            Stage::Sort(keys) => {
                level.order = resolve_order(collection, keys)?;
            }
            Stage::Skip(n) => level.offset += n,
            Stage::Limit(n) => {
                level.limit = Some(level.limit.map_or(*n, |l| l.min(*n)));
            }
            Stage::Lookup(key) => {
                let relation = collection.relation(key)?;
                if !lookups.iter().any(|r| std::ptr::eq(*r, relation)) {
                    lookups.push(relation);
                }
            }
            Stage::Project(keys) => {
                let mut cols = vec![collection.id_column()];
                for key in keys {
                    let column = collection.column(key)?;
                    if !cols.iter().any(|c| std::ptr::eq(*c, column)) {
                        cols.push(column);
                    }
                }
                projection = Some(cols);
            }
        }
    }

    Ok(Compiled {
        sql: level.render(&columns, &source),
        params,
        projection,
        lookups,
    })
}

pub fn compile_filter(
    collection: &'static Collection,
    filter: &Filter,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    let clause = match filter {
        Filter::Eq(field, value) => {
            let column = collection.column(field)?;
            if value.is_null() {
                format!("{} IS NULL", column.quoted())
            } else {
                params.push(column.to_sql(value)?);
                format!("{} = ?", column.quoted())
            }
        }
        Filter::Ne(field, value) => {
            let column = collection.column(field)?;
            if value.is_null() {
                format!("{} IS NOT NULL", column.quoted())
            } else {
                params.push(column.to_sql(value)?);
                format!("{} IS NOT ?", column.quoted())
            }
        }
        Filter::Gt(field, value) => comparison(collection, field, value, ">", params)?,
        Filter::Gte(field, value) => comparison(collection, field, value, ">=", params)?,
        Filter::Lt(field, value) => comparison(collection, field, value, "<", params)?,
        Filter::Lte(field, value) => comparison(collection, field, value, "<=", params)?,
        Filter::In(field, values) => {
            let column = collection.column(field)?;
            if values.is_empty() {
                return Ok("0".to_string());
            }
            let mut placeholders = Vec::with_capacity(values.len());
            for value in values {
                params.push(column.to_sql(value)?);
                placeholders.push("?");
            }
            format!("{} IN ({})", column.quoted(), placeholders.join(", "))
        }
        Filter::And(parts) => join_filters(collection, parts, " AND ", "1", params)?,
        Filter::Or(parts) => join_filters(collection, parts, " OR ", "0", params)?,
    };
    Ok(clause)
}

fn comparison(
    collection: &'static Collection,
    field: &str,
    value: &Value,
    op: &str,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    let column = collection.column(field)?;
    if value.is_null() {
        return Err(DbError::Validation(format!(
            "cannot order-compare '{}' against null",
            field
        )));
    }
    params.push(column.to_sql(value)?);
    Ok(format!("{} {} ?", column.quoted(), op))
}

fn join_filters(
    collection: &'static Collection,
    parts: &[Filter],
    sep: &str,
    empty: &str,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    if parts.is_empty() {
        return Ok(empty.to_string());
    }
    let clauses = parts
        .iter()
        .map(|p| compile_filter(collection, p, params))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", clauses.join(sep)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::{CONVERSATIONS, MESSAGES};
    use serde_json::json;

    #[test]
    fn excludes_soft_deleted_by_default() {
        let compiled = compile(&CONVERSATIONS, &Pipeline::new()).unwrap();
        assert!(compiled.sql.contains("WHERE \"is_deleted\" = 0"));

        let compiled = compile(&CONVERSATIONS, &Pipeline::new().with_deleted()).unwrap();
        assert!(!compiled.sql.contains("is_deleted\" ="));
    }

    #[test]
    fn match_after_limit_wraps_a_subquery() {
        let pipeline = Pipeline::new()
            .limit(5)
            .matching(Filter::eq("title", "x"));
        let compiled = compile(&CONVERSATIONS, &pipeline).unwrap();
        assert!(compiled.sql.contains("LIMIT 5) AS s1 WHERE \"title\" = ?"));
        assert_eq!(compiled.params, vec![SqlValue::Text("x".into())]);
    }

    #[test]
    fn consecutive_limits_keep_the_smaller() {
        let pipeline = Pipeline::new().skip(10).limit(7).limit(3);
        let compiled = compile(&CONVERSATIONS, &pipeline).unwrap();
        assert!(compiled.sql.ends_with("LIMIT 3 OFFSET 10"));
    }

    #[test]
    fn params_follow_textual_order() {
        let user = uuid::Uuid::new_v4().to_string();
        let pipeline = Pipeline::new()
            .matching(Filter::eq("userId", user.clone()))
            .limit(2)
            .matching(Filter::eq("title", "t"));
        let compiled = compile(&CONVERSATIONS, &pipeline).unwrap();
        assert_eq!(
            compiled.params,
            vec![SqlValue::Text(user), SqlValue::Text("t".into())]
        );
    }

    #[test]
    fn empty_or_matches_nothing() {
        let mut params = Vec::new();
        let clause = compile_filter(&MESSAGES, &Filter::Or(vec![]), &mut params).unwrap();
        assert_eq!(clause, "0");
        let clause = compile_filter(&MESSAGES, &Filter::one_of("sender", vec![]), &mut params)
            .unwrap();
        assert_eq!(clause, "0");
    }

    #[test]
    fn null_equality_uses_is_null() {
        let mut params = Vec::new();
        let clause =
            compile_filter(&MESSAGES, &Filter::eq("ideaId", json!(null)), &mut params).unwrap();
        assert_eq!(clause, "\"idea_id\" IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn sort_appends_identity_tiebreak() {
        let order =
            resolve_order(&MESSAGES, &[SortKey::new("createdAt", SortOrder::Desc)]).unwrap();
        assert_eq!(order.len(), 2);
        assert_eq!(order[1].0.sql, "id");
        assert_eq!(order[1].1, SortOrder::Desc);

        let order = resolve_order(&MESSAGES, &[SortKey::new("id", SortOrder::Asc)]).unwrap();
        assert_eq!(order.len(), 1);
    }

    #[test]
    fn projection_always_keeps_identity() {
        let compiled =
            compile(&MESSAGES, &Pipeline::new().project(["content"])).unwrap();
        let keys: Vec<_> = compiled.projection.unwrap().iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["id", "content"]);
    }

    #[test]
    fn unknown_lookup_is_rejected() {
        let err = compile(&CONVERSATIONS, &Pipeline::new().lookup("idea")).unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
    }
}
