//! PostgreSQL document store: one `jsonb` table per collection.
//!
//! Filters compile to SQL over jsonpath (`lax` mode fans out over arrays the same way
//! dotted paths do in memory). Text search uses `to_tsvector`/`to_tsquery` with the
//! `simple` configuration; radius search computes haversine distance in SQL.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx_core::query::{query, Query};
use sqlx_core::row::Row;
use sqlx_core::types::Json;
use sqlx_postgres::{PgArguments, PgPool, PgPoolOptions, Postgres};
use tokio::sync::RwLock;

use super::document::{self, IndexView};
use super::query::{CmpOp, Collection, Direction, Document, Filter, FindOptions, IndexSpec, Update, UpdateResult, ValueKind};
use super::text::TextQuery;
use super::DocumentStore;
use crate::error::CatalogError;
use crate::geo::EARTH_RADIUS_M;

impl From<sqlx_core::Error> for CatalogError {
  fn from(e: sqlx_core::Error) -> Self {
    if let Some(db) = e.as_database_error() {
      if db.code().as_deref() == Some("23505") {
        return CatalogError::DuplicateKey(db.message().to_string());
      }
    }
    CatalogError::StoreUnavailable(e.to_string())
  }
}

fn table(coll: Collection) -> &'static str {
  match coll {
    Collection::Items => "catalog_items",
    Collection::Events => "catalog_events",
  }
}

/// Path segments, restricted to identifier characters so they can be inlined.
fn segments(path: &str) -> Result<Vec<&str>, CatalogError> {
  let segs: Vec<&str> = path.split('.').collect();
  let ok = segs
    .iter()
    .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
  if ok {
    Ok(segs)
  } else {
    Err(CatalogError::invalid("path", &format!("unsupported field path {:?}", path)))
  }
}

/// `$."a"."b"[0]` style jsonpath.
fn jsonpath(path: &str) -> Result<String, CatalogError> {
  let mut out = String::from("$");
  for seg in segments(path)? {
    if seg.chars().all(|c| c.is_ascii_digit()) {
      out.push_str(&format!("[{}]", seg));
    } else {
      out.push_str(&format!(".\"{}\"", seg));
    }
  }
  Ok(out)
}

/// `'{a,b}'` text-array literal for `#>` / `#>>`.
fn pg_path(path: &str, extra: &[&str]) -> Result<String, CatalogError> {
  let mut segs = segments(path)?;
  segs.extend_from_slice(extra);
  Ok(format!("'{{{}}}'", segs.join(",")))
}

enum Bind {
  Text(String),
  Float(f64),
  Json(Value),
}

/// Accumulates SQL text and positional parameters for one statement.
struct SqlBuilder<'a> {
  binds: Vec<Bind>,
  indexes: &'a IndexView,
  collection: &'static str,
  aliases: usize,
  distance: Option<String>,
  rank: Option<String>,
}

impl<'a> SqlBuilder<'a> {
  fn new(indexes: &'a IndexView, collection: &'static str) -> Self {
    Self {
      binds: Vec::new(),
      indexes,
      collection,
      aliases: 0,
      distance: None,
      rank: None,
    }
  }

  fn param(&mut self, b: Bind) -> String {
    self.binds.push(b);
    format!("${}", self.binds.len())
  }

  fn path_exists(&mut self, d: &str, jp: String, vars: Option<Value>) -> String {
    let p = self.param(Bind::Text(jp));
    match vars {
      Some(v) => {
        let v = self.param(Bind::Json(v));
        format!("jsonb_path_exists({}, {}::jsonpath, {})", d, p, v)
      }
      None => format!("jsonb_path_exists({}, {}::jsonpath)", d, p),
    }
  }

  fn compile(&mut self, filter: &Filter, d: &str) -> Result<String, CatalogError> {
    Ok(match filter {
      Filter::All => "TRUE".into(),
      Filter::Eq(path, v) => {
        let jp = format!("{}[*] ? (@ == $v)", jsonpath(path)?);
        self.path_exists(d, jp, Some(json!({ "v": v })))
      }
      Filter::Cmp(path, op, v) => {
        let sym = match op {
          CmpOp::Gt => ">",
          CmpOp::Gte => ">=",
        };
        let jp = format!("{}[*] ? (@ {} $v)", jsonpath(path)?, sym);
        self.path_exists(d, jp, Some(json!({ "v": v })))
      }
      Filter::ContainsAll(path, values) => {
        if values.is_empty() {
          return Ok("FALSE".into());
        }
        let parts = values
          .iter()
          .map(|v| self.compile(&Filter::Eq(path.clone(), v.clone()), d))
          .collect::<Result<Vec<_>, _>>()?;
        format!("({})", parts.join(" AND "))
      }
      Filter::Exists(path, want) => {
        let e = self.path_exists(d, jsonpath(path)?, None);
        if *want {
          e
        } else {
          format!("NOT {}", e)
        }
      }
      Filter::Type(path, kind) => {
        let name = match kind {
          ValueKind::Null => "null",
          ValueKind::Bool => "boolean",
          ValueKind::Number => "number",
          ValueKind::String => "string",
          ValueKind::Array => "array",
          ValueKind::Object => "object",
        };
        let jp = format!("{} ? (@.type() == \"{}\")", jsonpath(path)?, name);
        self.path_exists(d, jp, None)
      }
      Filter::Regex {
        path,
        pattern,
        case_insensitive,
      } => {
        let jp = self.param(Bind::Text(format!("{}[*]", jsonpath(path)?)));
        let re = self.param(Bind::Text(pattern.clone()));
        let op = if *case_insensitive { "~*" } else { "~" };
        format!(
          "EXISTS (SELECT 1 FROM jsonb_path_query({}, {}::jsonpath) AS rx(val) \
           WHERE jsonb_typeof(rx.val) = 'string' AND (rx.val #>> '{{}}') {} {})",
          d, jp, op, re
        )
      }
      Filter::Text(q) => {
        let fields = self.indexes.text_fields.clone().ok_or(CatalogError::IndexMissing {
          collection: self.collection,
          kind: "text",
        })?;
        let parsed = TextQuery::parse(q);
        if parsed.is_empty() {
          return Ok("FALSE".into());
        }
        let vector = text_vector(d, &fields)?;
        let tsq = self.param(Bind::Text(parsed.to_tsquery()));
        let tsquery = format!("to_tsquery('simple', {})", tsq);
        self.rank = Some(format!("ts_rank({}, {})", vector, tsquery));
        format!("{} @@ {}", vector, tsquery)
      }
      Filter::Near {
        path,
        center,
        max_meters,
      } => {
        if !self.indexes.geo_paths.iter().any(|p| p == path) {
          return Err(CatalogError::IndexMissing {
            collection: self.collection,
            kind: "2dsphere",
          });
        }
        let lng_path = pg_path(path, &["coordinates", "0"])?;
        let lat_path = pg_path(path, &["coordinates", "1"])?;
        let lat0 = self.param(Bind::Float(center.lat()));
        let lng0 = self.param(Bind::Float(center.lng()));
        let max = self.param(Bind::Float(*max_meters));
        let lat = format!("({} #>> {})::float8", d, lat_path);
        let lng = format!("({} #>> {})::float8", d, lng_path);
        let dist = format!(
          "CASE WHEN jsonb_typeof({d} #> {lat_path}) = 'number' AND jsonb_typeof({d} #> {lng_path}) = 'number' \
           THEN {r} * 2 * asin(least(1.0, sqrt(power(sin(radians({lat} - {lat0}::float8) / 2), 2) \
           + cos(radians({lat0}::float8)) * cos(radians({lat})) * power(sin(radians({lng} - {lng0}::float8) / 2), 2)))) END",
          d = d,
          lat_path = lat_path,
          lng_path = lng_path,
          r = EARTH_RADIUS_M,
          lat = lat,
          lng = lng,
          lat0 = lat0,
          lng0 = lng0,
        );
        self.distance = Some(dist.clone());
        format!("({}) <= {}::float8", dist, max)
      }
      Filter::ElemMatch(path, inner) => {
        self.aliases += 1;
        let alias = format!("el{}", self.aliases);
        let p = pg_path(path, &[])?;
        let inner_sql = self.compile(inner, &format!("{}.value", alias))?;
        format!(
          "EXISTS (SELECT 1 FROM jsonb_array_elements(CASE WHEN jsonb_typeof({d} #> {p}) = 'array' \
           THEN {d} #> {p} ELSE '[]'::jsonb END) AS {a}(value) WHERE {inner})",
          d = d,
          p = p,
          a = alias,
          inner = inner_sql
        )
      }
      Filter::And(fs) => {
        if fs.is_empty() {
          return Ok("TRUE".into());
        }
        let parts = fs
          .iter()
          .map(|f| self.compile(f, d))
          .collect::<Result<Vec<_>, _>>()?;
        format!("({})", parts.join(" AND "))
      }
      Filter::Not(f) => format!("NOT ({})", self.compile(f, d)?),
    })
  }
}

fn text_vector(d: &str, fields: &[String]) -> Result<String, CatalogError> {
  let cols = fields
    .iter()
    .map(|f| pg_path(f, &[]).map(|p| format!("{} #>> {}", d, p)))
    .collect::<Result<Vec<_>, _>>()?;
  Ok(format!("to_tsvector('simple', concat_ws(' ', {}))", cols.join(", ")))
}

fn bind_all(sql: &str, binds: Vec<Bind>) -> Query<'_, Postgres, PgArguments> {
  let mut q = query::<Postgres>(sql);
  for b in binds {
    q = match b {
      Bind::Text(s) => q.bind(s),
      Bind::Float(f) => q.bind(f),
      Bind::Json(v) => q.bind(Json(v)),
    };
  }
  q
}

fn row_doc(row: &sqlx_postgres::PgRow) -> Result<Document, CatalogError> {
  let Json(v): Json<Value> = row.try_get("doc")?;
  match v {
    Value::Object(doc) => Ok(doc),
    other => Err(CatalogError::unavailable(format!("stored document is not an object: {}", other))),
  }
}

/// Store backed by PostgreSQL.
pub struct PgStore {
  pool: PgPool,
  indexes: RwLock<HashMap<Collection, IndexView>>,
}

impl PgStore {
  pub async fn connect(database_url: &str) -> Result<Self, CatalogError> {
    let pool = PgPoolOptions::new()
      .max_connections(8)
      .connect(database_url)
      .await?;
    Self::from_pool(pool).await
  }

  /// Ensure the schema exists and load known indexes.
  pub async fn from_pool(pool: PgPool) -> Result<Self, CatalogError> {
    for coll in [Collection::Items, Collection::Events] {
      let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (seq BIGSERIAL, id TEXT PRIMARY KEY, doc JSONB NOT NULL)",
        table(coll)
      );
      query::<Postgres>(&sql).execute(&pool).await?;
    }
    query::<Postgres>(
      "CREATE TABLE IF NOT EXISTS catalog_indexes (\
       collection TEXT NOT NULL, name TEXT NOT NULL, spec JSONB NOT NULL, \
       PRIMARY KEY (collection, name))",
    )
    .execute(&pool)
    .await?;

    let store = Self {
      pool,
      indexes: RwLock::new(HashMap::new()),
    };
    store.reload_indexes().await?;
    Ok(store)
  }

  /// Underlying pool, for adapters sharing the database.
  pub fn pool(&self) -> &PgPool {
    &self.pool
  }

  async fn reload_indexes(&self) -> Result<(), CatalogError> {
    let rows = query::<Postgres>("SELECT collection, spec FROM catalog_indexes")
      .fetch_all(&self.pool)
      .await?;
    let mut views: HashMap<Collection, IndexView> = HashMap::new();
    for row in rows {
      let coll: String = row.try_get("collection")?;
      let Json(spec): Json<Value> = row.try_get("spec")?;
      let coll = match coll.as_str() {
        "items" => Collection::Items,
        "events" => Collection::Events,
        _ => continue,
      };
      let view = views.entry(coll).or_default();
      match spec_from_json(&spec) {
        Some(IndexSpec::Text(fields)) => view.text_fields = Some(fields),
        Some(IndexSpec::Geo2dSphere(p)) => view.geo_paths.push(p),
        _ => {}
      }
    }
    *self.indexes.write().await = views;
    Ok(())
  }

  async fn view(&self, coll: Collection) -> IndexView {
    self.indexes.read().await.get(&coll).cloned().unwrap_or_default()
  }

  async fn update_impl(
    &self,
    coll: Collection,
    filter: &Filter,
    update: &Update,
    mut upsert: bool,
    multi: bool,
  ) -> Result<UpdateResult, CatalogError> {
    let view = self.view(coll).await;
    loop {
      let mut b = SqlBuilder::new(&view, coll.name());
      let cond = b.compile(filter, "doc")?;
      let sql = format!(
        "SELECT seq, doc FROM {} WHERE {} ORDER BY seq{} FOR UPDATE",
        table(coll),
        cond,
        if multi { "" } else { " LIMIT 1" }
      );

      let mut tx = self.pool.begin().await?;
      let rows = bind_all(&sql, b.binds).fetch_all(&mut *tx).await?;
      let mut result = UpdateResult::default();

      for row in &rows {
        let seq: i64 = row.try_get("seq")?;
        let mut doc = row_doc(row)?;
        result.matched += 1;
        if document::apply_update(&mut doc, update)? {
          result.modified += 1;
          let write = format!("UPDATE {} SET doc = $1 WHERE seq = $2", table(coll));
          query::<Postgres>(&write)
            .bind(Json(Value::Object(doc)))
            .bind(seq)
            .execute(&mut *tx)
            .await?;
        }
      }

      if rows.is_empty() && upsert {
        let seed = document::upsert_seed(filter, update)?;
        let id = document::doc_id(&seed)?;
        let insert = format!(
          "INSERT INTO {} (id, doc) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
          table(coll)
        );
        let done = query::<Postgres>(&insert)
          .bind(id.clone())
          .bind(Json(Value::Object(seed)))
          .execute(&mut *tx)
          .await?;
        tx.commit().await?;
        if done.rows_affected() == 0 {
          // A concurrent upsert created the record first; update it instead.
          upsert = false;
          continue;
        }
        result.upserted_id = Some(id);
        return Ok(result);
      }

      tx.commit().await?;
      return Ok(result);
    }
  }
}

fn spec_to_json(spec: &IndexSpec) -> Value {
  match spec {
    IndexSpec::Ascending(p) => json!({ "kind": "ascending", "path": p }),
    IndexSpec::Text(fields) => json!({ "kind": "text", "fields": fields }),
    IndexSpec::Geo2dSphere(p) => json!({ "kind": "2dsphere", "path": p }),
  }
}

fn spec_from_json(v: &Value) -> Option<IndexSpec> {
  let path = || v.get("path").and_then(Value::as_str).map(str::to_string);
  match v.get("kind")?.as_str()? {
    "ascending" => path().map(IndexSpec::Ascending),
    "2dsphere" => path().map(IndexSpec::Geo2dSphere),
    "text" => {
      let fields = v
        .get("fields")?
        .as_array()?
        .iter()
        .filter_map(|f| f.as_str().map(str::to_string))
        .collect();
      Some(IndexSpec::Text(fields))
    }
    _ => None,
  }
}

/// Physical index DDL for a spec.
fn index_ddl(coll: Collection, spec: &IndexSpec) -> Result<String, CatalogError> {
  let t = table(coll);
  let ident = spec
    .name()
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
    .collect::<String>();
  Ok(match spec {
    IndexSpec::Ascending(p) => format!(
      "CREATE INDEX IF NOT EXISTS {t}_{ident} ON {t} ((doc #> {p}))",
      t = t,
      ident = ident,
      p = pg_path(p, &[])?
    ),
    IndexSpec::Text(fields) => format!(
      "CREATE INDEX IF NOT EXISTS {t}_{ident} ON {t} USING gin ({v})",
      t = t,
      ident = ident,
      v = text_vector("doc", fields)?
    ),
    IndexSpec::Geo2dSphere(p) => format!(
      "CREATE INDEX IF NOT EXISTS {t}_{ident} ON {t} (((doc #>> {lat})::float8), ((doc #>> {lng})::float8))",
      t = t,
      ident = ident,
      lat = pg_path(p, &["coordinates", "1"])?,
      lng = pg_path(p, &["coordinates", "0"])?
    ),
  })
}

#[async_trait]
impl DocumentStore for PgStore {
  fn name(&self) -> &'static str {
    "postgres"
  }

  async fn create_index(&self, coll: Collection, index: &IndexSpec) -> Result<(), CatalogError> {
    let view = self.view(coll).await;
    if let (IndexSpec::Text(fields), Some(existing)) = (index, &view.text_fields) {
      if fields == existing {
        return Ok(());
      }
      return Err(CatalogError::invalid(
        "index",
        "collection already has a different text index",
      ));
    }

    query::<Postgres>(&index_ddl(coll, index)?).execute(&self.pool).await?;
    query::<Postgres>(
      "INSERT INTO catalog_indexes (collection, name, spec) VALUES ($1, $2, $3) \
       ON CONFLICT (collection, name) DO NOTHING",
    )
    .bind(coll.name())
    .bind(index.name())
    .bind(Json(spec_to_json(index)))
    .execute(&self.pool)
    .await?;

    let mut views = self.indexes.write().await;
    let view = views.entry(coll).or_default();
    match index {
      IndexSpec::Text(fields) => view.text_fields = Some(fields.clone()),
      IndexSpec::Geo2dSphere(p) if !view.geo_paths.contains(p) => view.geo_paths.push(p.clone()),
      _ => {}
    }
    Ok(())
  }

  async fn find(
    &self,
    coll: Collection,
    filter: &Filter,
    options: &FindOptions,
  ) -> Result<Vec<Document>, CatalogError> {
    let view = self.view(coll).await;
    let mut b = SqlBuilder::new(&view, coll.name());
    let cond = b.compile(filter, "doc")?;

    let order = if !options.sort.is_empty() {
      options
        .sort
        .iter()
        .map(|(path, dir)| {
          pg_path(path, &[]).map(|p| match dir {
            Direction::Asc => format!("doc #> {} ASC NULLS FIRST", p),
            Direction::Desc => format!("doc #> {} DESC NULLS LAST", p),
          })
        })
        .collect::<Result<Vec<_>, _>>()?
        .join(", ")
    } else if let Some(dist) = &b.distance {
      format!("{} ASC", dist)
    } else if let Some(rank) = &b.rank {
      format!("{} DESC", rank)
    } else {
      "seq ASC".into()
    };

    let mut sql = format!("SELECT doc FROM {} WHERE {} ORDER BY {}", table(coll), cond, order);
    if let Some(n) = options.limit {
      sql.push_str(&format!(" LIMIT {}", n));
    }

    let rows = bind_all(&sql, b.binds).fetch_all(&self.pool).await?;
    rows
      .iter()
      .map(|row| {
        let doc = row_doc(row)?;
        Ok(match &options.projection {
          Some(fields) => document::project(&doc, fields),
          None => doc,
        })
      })
      .collect()
  }

  async fn insert_one(&self, coll: Collection, doc: Document) -> Result<(), CatalogError> {
    let id = document::doc_id(&doc)?;
    let sql = format!("INSERT INTO {} (id, doc) VALUES ($1, $2)", table(coll));
    query::<Postgres>(&sql)
      .bind(id)
      .bind(Json(Value::Object(doc)))
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn insert_many(&self, coll: Collection, docs: Vec<Document>) -> Result<u64, CatalogError> {
    let mut n = 0;
    for doc in docs {
      self.insert_one(coll, doc).await?;
      n += 1;
    }
    Ok(n)
  }

  async fn update_one(
    &self,
    coll: Collection,
    filter: &Filter,
    update: &Update,
    upsert: bool,
  ) -> Result<UpdateResult, CatalogError> {
    self.update_impl(coll, filter, update, upsert, false).await
  }

  async fn update_many(
    &self,
    coll: Collection,
    filter: &Filter,
    update: &Update,
    upsert: bool,
  ) -> Result<UpdateResult, CatalogError> {
    self.update_impl(coll, filter, update, upsert, true).await
  }

  async fn delete_many(&self, coll: Collection, filter: &Filter) -> Result<u64, CatalogError> {
    let view = self.view(coll).await;
    let mut b = SqlBuilder::new(&view, coll.name());
    let cond = b.compile(filter, "doc")?;
    let sql = format!("DELETE FROM {} WHERE {}", table(coll), cond);
    let done = bind_all(&sql, b.binds).execute(&self.pool).await?;
    Ok(done.rows_affected())
  }

  async fn count(&self, coll: Collection, filter: &Filter) -> Result<u64, CatalogError> {
    let view = self.view(coll).await;
    let mut b = SqlBuilder::new(&view, coll.name());
    let cond = b.compile(filter, "doc")?;
    let sql = format!("SELECT COUNT(*) AS n FROM {} WHERE {}", table(coll), cond);
    let row = bind_all(&sql, b.binds).fetch_one(&self.pool).await?;
    let n: i64 = row.try_get("n")?;
    Ok(n as u64)
  }
}
