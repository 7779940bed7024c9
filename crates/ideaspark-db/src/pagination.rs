//! The four pagination strategies: offset over a find, offset over a
//! pipeline, cursor over a find, cursor over a pipeline.
//!
//! Every strategy orders by its sort field and then by identity, so results
//! are deterministic even when many rows share a sort value.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use serde_json::Value;

use ideaspark_types::pagination::{CursorPage, Page, PageMeta, PaginationQuery, SortOrder};

use crate::collections::{
    Collection, Column, ColumnKind, Document, ID, IS_DELETED_SQL, Relation, read_document,
};
use crate::cursor::Cursor;
use crate::query::{
    Compiled, FindQuery, Filter, Pipeline, SortKey, Stage, column_list, compile, order_clause,
    resolve_order,
};
use crate::{Database, DbError, Result};

/// Defaults applied to a client's `PaginationQuery` when it leaves a field out.
#[derive(Debug, Clone, Copy)]
pub struct PageDefaults {
    pub limit: u32,
    pub sort_field: &'static str,
    pub sort_order: SortOrder,
}

impl PageDefaults {
    /// Newest first. Conversation lists and most offset pages.
    pub const RECENT_FIRST: Self = Self {
        limit: 20,
        sort_field: "createdAt",
        sort_order: SortOrder::Desc,
    };

    /// Oldest first, for reading a conversation top to bottom.
    pub const CHRONOLOGICAL: Self = Self {
        limit: 20,
        sort_field: "createdAt",
        sort_order: SortOrder::Asc,
    };

    pub const CURSOR: Self = Self {
        limit: 20,
        sort_field: ID,
        sort_order: SortOrder::Desc,
    };

    fn sort(&self, query: &PaginationQuery) -> SortKey {
        match &query.sort_field {
            // An explicit field without an explicit order sorts ascending.
            Some(field) => SortKey::new(field.clone(), query.sort_order.unwrap_or(SortOrder::Asc)),
            None => SortKey::new(self.sort_field, query.sort_order.unwrap_or(self.sort_order)),
        }
    }

    fn limit(&self, query: &PaginationQuery) -> u32 {
        query.limit.filter(|l| *l > 0).unwrap_or(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
    pub sort: SortKey,
}

impl PageRequest {
    pub fn resolve(query: &PaginationQuery, defaults: PageDefaults) -> Self {
        Self {
            page: query.page.filter(|p| *p > 0).unwrap_or(1),
            limit: defaults.limit(query),
            sort: defaults.sort(query),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorRequest {
    pub cursor: Option<String>,
    pub limit: u32,
    pub sort: SortKey,
}

impl CursorRequest {
    pub fn resolve(query: &PaginationQuery, defaults: PageDefaults) -> Self {
        Self {
            cursor: query.cursor.clone().filter(|c| !c.trim().is_empty()),
            limit: defaults.limit(query),
            sort: defaults.sort(query),
        }
    }
}

// -- Offset --

/// Offset page over a plain find. Count and fetch run concurrently.
pub async fn find_page(
    db: &Arc<Database>,
    collection: &'static Collection,
    query: FindQuery,
    request: &PageRequest,
) -> Result<Page<Document>> {
    let order = resolve_order(collection, std::slice::from_ref(&request.sort))?;

    let counted = compile(collection, &query.to_pipeline())?;
    let count_sql = format!("SELECT COUNT(*) FROM ({}) AS base", counted.sql);
    let count_params = counted.params;

    let pipeline = query
        .to_pipeline()
        .sort(vec![request.sort.clone()])
        .skip(request.offset())
        .limit(u64::from(request.limit));

    let (total, data) = tokio::try_join!(
        db.run(move |db| {
            db.with_conn(|conn| {
                let n: i64 =
                    conn.query_row(&count_sql, params_from_iter(count_params.iter()), |r| {
                        r.get(0)
                    })?;
                Ok(u64::try_from(n).unwrap_or(0))
            })
        }),
        fetch(db, collection, pipeline, order),
    )?;

    Ok(Page {
        data,
        meta: PageMeta::new(request.page, request.limit, total),
    })
}

/// Offset page over a caller pipeline. Any skip/limit the caller left in the
/// pipeline is dropped, and a sort stage in the pipeline takes precedence
/// over the requested sort. Total and data come back in one statement.
pub async fn aggregate_page(
    db: &Arc<Database>,
    collection: &'static Collection,
    pipeline: Pipeline,
    request: &PageRequest,
) -> Result<Page<Document>> {
    let mut stages: Vec<Stage> = pipeline
        .stages
        .into_iter()
        .filter(|s| !matches!(s, Stage::Skip(_) | Stage::Limit(_)))
        .collect();

    let sort = match stages.iter().position(|s| matches!(s, Stage::Sort(_))) {
        Some(idx) => match stages.remove(idx) {
            Stage::Sort(keys) => keys,
            _ => vec![request.sort.clone()],
        },
        None => vec![request.sort.clone()],
    };
    let order = resolve_order(collection, &sort)?;

    let base = compile(
        collection,
        &Pipeline {
            stages,
            deleted: pipeline.deleted,
        },
    )?;
    let columns = output_columns(collection, &base, &order)?;

    let sql = format!(
        "WITH base AS ({base}) \
         SELECT t.total, {cols} \
         FROM (SELECT COUNT(*) AS total FROM base) AS t \
         LEFT JOIN (SELECT * FROM base ORDER BY {inner} LIMIT {limit} OFFSET {offset}) AS p ON 1 = 1 \
         ORDER BY {outer}",
        base = base.sql,
        cols = column_list(&columns, Some("p")),
        inner = order_clause(&order, None),
        limit = request.limit,
        offset = request.offset(),
        outer = order_clause(&order, Some("p")),
    );
    let params = base.params;
    let lookups = base.lookups;

    let (total, data) = db
        .run(move |db| {
            db.with_conn(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params_from_iter(params.iter()))?;
                let mut total = 0u64;
                let mut docs = Vec::new();
                while let Some(row) = rows.next()? {
                    total = u64::try_from(row.get::<_, i64>(0)?).unwrap_or(0);
                    // The left join yields one all-null row when the page is empty.
                    if row.get::<_, Option<String>>(1)?.is_none() {
                        continue;
                    }
                    docs.push(read_document(row, &columns, 1)?);
                }
                resolve_lookups(conn, &lookups, &mut docs)?;
                Ok((total, docs))
            })
        })
        .await?;

    Ok(Page {
        data,
        meta: PageMeta::new(request.page, request.limit, total),
    })
}

// -- Cursor --

pub async fn cursor_paginate(
    db: &Arc<Database>,
    collection: &'static Collection,
    query: FindQuery,
    request: &CursorRequest,
) -> Result<CursorPage<Document>> {
    cursor_page(db, collection, query.to_pipeline(), request).await
}

pub async fn cursor_aggregate(
    db: &Arc<Database>,
    collection: &'static Collection,
    pipeline: Pipeline,
    request: &CursorRequest,
) -> Result<CursorPage<Document>> {
    cursor_page(db, collection, pipeline, request).await
}

async fn cursor_page(
    db: &Arc<Database>,
    collection: &'static Collection,
    mut pipeline: Pipeline,
    request: &CursorRequest,
) -> Result<CursorPage<Document>> {
    let sort = &request.sort;
    let column = cursor_column(collection, sort)?;

    if let Some(token) = &request.cursor {
        pipeline = pipeline.matching(after_cursor(collection, column, sort, token)?);
    }

    let limit = request.limit as usize;
    let pipeline = pipeline
        .sort(vec![sort.clone()])
        .limit(limit as u64 + 1);
    let order = resolve_order(collection, std::slice::from_ref(sort))?;

    let mut data = fetch(db, collection, pipeline, order).await?;

    let has_next_page = data.len() > limit;
    data.truncate(limit);

    let next_cursor = match (has_next_page, data.last()) {
        (true, Some(last)) => {
            let id = last
                .get(ID)
                .and_then(Value::as_str)
                .ok_or_else(|| DbError::Validation("row has no identity".into()))?;
            let value = last.get(column.key).cloned().unwrap_or(Value::Null);
            Some(Cursor::new(column.key, value, id).encode()?)
        }
        _ => None,
    };

    Ok(CursorPage {
        data,
        has_next_page,
        next_cursor,
    })
}

/// Cursor sort fields must be totally ordered, which rules out nullable and
/// list columns.
fn cursor_column(collection: &'static Collection, sort: &SortKey) -> Result<&'static Column> {
    let column = collection.column(&sort.field)?;
    if column.nullable || column.kind == ColumnKind::TextList {
        return Err(DbError::Validation(format!(
            "field '{}' cannot be used for cursor pagination",
            sort.field
        )));
    }
    Ok(column)
}

/// `field > value OR (field = value AND id > cursor_id)`, with `<` when
/// descending.
fn after_cursor(
    collection: &'static Collection,
    column: &'static Column,
    sort: &SortKey,
    token: &str,
) -> Result<Filter> {
    let cursor = Cursor::decode(token)?;
    if cursor.field != column.key {
        return Err(DbError::InvalidCursor(format!(
            "cursor is for '{}', not '{}'",
            cursor.field, column.key
        )));
    }

    let past = |field: &str, value: Value| match sort.order {
        SortOrder::Asc => Filter::Gt(field.to_string(), value),
        SortOrder::Desc => Filter::Lt(field.to_string(), value),
    };
    let id = Value::String(cursor.id);

    if std::ptr::eq(column, collection.id_column()) {
        return Ok(past(ID, id));
    }

    column
        .to_sql(&cursor.value)
        .map_err(|e| DbError::InvalidCursor(e.to_string()))?;

    Ok(Filter::Or(vec![
        past(column.key, cursor.value.clone()),
        Filter::And(vec![
            Filter::Eq(column.key.to_string(), cursor.value),
            past(ID, id),
        ]),
    ]))
}

// -- Shared --

/// Count matching documents without fetching them.
pub async fn count(
    db: &Arc<Database>,
    collection: &'static Collection,
    query: FindQuery,
) -> Result<u64> {
    let compiled = compile(collection, &query.to_pipeline())?;
    let sql = format!("SELECT COUNT(*) FROM ({}) AS base", compiled.sql);
    let params = compiled.params;
    db.run(move |db| {
        db.with_conn(|conn| {
            let n: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |r| r.get(0))?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
    })
    .await
}

async fn fetch(
    db: &Arc<Database>,
    collection: &'static Collection,
    pipeline: Pipeline,
    order: Vec<(&'static Column, SortOrder)>,
) -> Result<Vec<Document>> {
    let compiled = compile(collection, &pipeline)?;
    let columns = output_columns(collection, &compiled, &order)?;
    let sql = format!(
        "SELECT {} FROM ({}) AS page ORDER BY {}",
        column_list(&columns, None),
        compiled.sql,
        order_clause(&order, None)
    );
    let params = compiled.params;
    let lookups = compiled.lookups;

    db.run(move |db| {
        db.with_conn(|conn| {
            let mut docs = query_documents(conn, &sql, &params, &columns)?;
            resolve_lookups(conn, &lookups, &mut docs)?;
            Ok(docs)
        })
    })
    .await
}

/// Columns a page returns: the projection if there is one, widened with
/// the sort columns and the local side of every lookup.
fn output_columns(
    collection: &'static Collection,
    compiled: &Compiled,
    order: &[(&'static Column, SortOrder)],
) -> Result<Vec<&'static Column>> {
    let Some(projection) = &compiled.projection else {
        return Ok(collection.columns.iter().collect());
    };

    let mut columns = projection.clone();
    let mut add = |column: &'static Column| {
        if !columns.iter().any(|c| std::ptr::eq(*c, column)) {
            columns.push(column);
        }
    };
    for (column, _) in order {
        add(column);
    }
    for relation in &compiled.lookups {
        add(collection.column(relation.local)?);
    }
    Ok(columns)
}

fn query_documents(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
    columns: &[&'static Column],
) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(sql)?;
    let docs = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            read_document(row, columns, 0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(docs)
}

/// Resolve each relation with one batched query, the way `populate` does.
/// Missing or soft-deleted targets resolve to null.
fn resolve_lookups(
    conn: &Connection,
    relations: &[&'static Relation],
    docs: &mut [Document],
) -> Result<()> {
    for relation in relations {
        let mut ids: Vec<String> = docs
            .iter()
            .filter_map(|d| d.get(relation.local).and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();

        let mut found: HashMap<String, Document> = HashMap::new();
        if !ids.is_empty() {
            let target = relation.target;
            let columns: Vec<&'static Column> = target.columns.iter().collect();
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM \"{}\" WHERE \"{}\" = 0 AND {} IN ({})",
                column_list(&columns, None),
                target.table,
                IS_DELETED_SQL,
                target.id_column().quoted(),
                placeholders
            );
            let params: Vec<SqlValue> = ids.into_iter().map(SqlValue::Text).collect();
            for doc in query_documents(conn, &sql, &params, &columns)? {
                if let Some(id) = doc.get(ID).and_then(Value::as_str) {
                    found.insert(id.to_string(), doc.clone());
                }
            }
        }

        for doc in docs.iter_mut() {
            let resolved = doc
                .get(relation.local)
                .and_then(Value::as_str)
                .and_then(|id| found.get(id))
                .map(|d| Value::Object(d.clone()))
                .unwrap_or(Value::Null);
            doc.insert(relation.key.to_string(), resolved);
        }
    }
    Ok(())
}
