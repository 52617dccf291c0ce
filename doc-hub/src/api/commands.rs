//! Command dispatch: one reply per inbound request.

use super::AppState;
use doc_hub_core::db::FindOptions;
use doc_hub_core::filter::{parse_pipeline, Filter, SortOrder, UpdateSpec};
use doc_hub_core::transport::{Connection, Message};
use doc_hub_core::watch::WatchFilter;
use doc_hub_core::{Document, StoreError, Subject};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

#[derive(Deserialize)]
struct SigninRequest {
    jwt: String,
}

#[derive(Deserialize)]
struct QueryRequest {
    collectionname: String,
    #[serde(default)]
    query: Value,
    #[serde(default)]
    projection: Vec<String>,
    #[serde(default)]
    orderby: Map<String, Value>,
    #[serde(default)]
    skip: usize,
    top: Option<usize>,
}

#[derive(Deserialize)]
struct CountRequest {
    collectionname: String,
    #[serde(default)]
    query: Value,
}

#[derive(Deserialize)]
struct DistinctRequest {
    collectionname: String,
    field: String,
    #[serde(default)]
    query: Value,
}

#[derive(Deserialize)]
struct AggregateRequest {
    collectionname: String,
    aggregates: Value,
}

#[derive(Deserialize)]
struct InsertOneRequest {
    collectionname: String,
    item: Document,
}

#[derive(Deserialize)]
struct InsertManyRequest {
    collectionname: String,
    items: Vec<Document>,
}

#[derive(Deserialize)]
struct UpdateRequest {
    collectionname: String,
    item: Value,
    query: Option<Value>,
}

#[derive(Deserialize)]
struct UpsertRequest {
    collectionname: String,
    item: Document,
    /// Comma-separated key fields.
    #[serde(default)]
    uniqueness: String,
}

#[derive(Deserialize)]
struct DeleteOneRequest {
    collectionname: String,
    id: String,
    #[serde(default)]
    recursive: bool,
}

#[derive(Deserialize)]
struct DeleteManyRequest {
    collectionname: String,
    query: Value,
    #[serde(default)]
    recursive: bool,
}

#[derive(Deserialize)]
struct VersionRequest {
    collectionname: String,
    id: String,
    version: Option<u64>,
}

#[derive(Deserialize)]
struct WatchRequest {
    collectionname: String,
    #[serde(default)]
    paths: Value,
}

#[derive(Deserialize)]
struct UnwatchRequest {
    id: String,
}

fn parse<T: DeserializeOwned>(message: &Message) -> Result<T, StoreError> {
    serde_json::from_str(&message.data)
        .map_err(|e| StoreError::Validation(format!("{} request: {e}", message.command)))
}

fn signed_in(conn: &Connection) -> Result<Subject, StoreError> {
    conn.subject()
        .ok_or_else(|| StoreError::AccessDenied("not signed in".to_string()))
}

fn documents(docs: Vec<Document>) -> Value {
    Value::Array(docs.into_iter().map(Document::into_value).collect())
}

fn sort_order(value: &Value) -> SortOrder {
    match value {
        Value::Number(n) if n.as_i64() == Some(-1) => SortOrder::Descending,
        Value::String(s) if s.eq_ignore_ascii_case("desc") || s.eq_ignore_ascii_case("descending") => {
            SortOrder::Descending
        }
        _ => SortOrder::Ascending,
    }
}

fn is_operator_update(item: &Value) -> bool {
    item.as_object()
        .is_some_and(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

pub async fn dispatch(state: &AppState, conn: &Arc<Connection>, message: &Message) -> Result<Value, StoreError> {
    let store = &state.store;
    match message.command.as_str() {
        "ping" => Ok(json!({})),
        "signin" => {
            let req: SigninRequest = parse(message)?;
            let claims = state
                .verifier
                .verify(&req.jwt)
                .await
                .ok_or_else(|| StoreError::AccessDenied("invalid token".to_string()))?;
            let record = store
                .directory()
                .lookup(&claims.sub)
                .await?
                .ok_or_else(|| StoreError::AccessDenied("unknown subject".to_string()))?;
            if record.disabled || record.locked {
                return Err(StoreError::AccessDenied(format!("{} is disabled", record.name)));
            }
            let subject = store
                .directory()
                .resolve(&claims.sub)
                .await?
                .ok_or_else(|| StoreError::AccessDenied("unknown subject".to_string()))?;
            info!(connection = %conn.id(), subject = %subject.id, "signed in");
            conn.set_subject(subject.clone());
            Ok(json!({ "user": subject }))
        }
        "query" => {
            let subject = signed_in(conn)?;
            let req: QueryRequest = parse(message)?;
            let options = FindOptions {
                sort: req
                    .orderby
                    .iter()
                    .map(|(field, order)| (field.clone(), sort_order(order)))
                    .collect(),
                skip: req.skip,
                limit: req.top,
                projection: req.projection,
            };
            let filter = Filter::from_query(&req.query)?;
            let docs = store.query(&subject, &req.collectionname, filter, options).await?;
            Ok(json!({ "result": documents(docs) }))
        }
        "count" => {
            let subject = signed_in(conn)?;
            let req: CountRequest = parse(message)?;
            let filter = Filter::from_query(&req.query)?;
            let count = store.count(&subject, &req.collectionname, filter).await?;
            Ok(json!({ "result": count }))
        }
        "distinct" => {
            let subject = signed_in(conn)?;
            let req: DistinctRequest = parse(message)?;
            let filter = Filter::from_query(&req.query)?;
            let values = store
                .distinct(&subject, &req.collectionname, &req.field, filter)
                .await?;
            Ok(json!({ "result": values }))
        }
        "aggregate" => {
            let subject = signed_in(conn)?;
            let req: AggregateRequest = parse(message)?;
            let pipeline = parse_pipeline(&req.aggregates)?;
            let docs = store.aggregate(&subject, &req.collectionname, pipeline).await?;
            Ok(json!({ "result": documents(docs) }))
        }
        "insertone" => {
            let subject = signed_in(conn)?;
            let req: InsertOneRequest = parse(message)?;
            let doc = store.insert_one(&subject, &req.collectionname, req.item).await?;
            Ok(json!({ "result": doc }))
        }
        "insertmany" => {
            let subject = signed_in(conn)?;
            let req: InsertManyRequest = parse(message)?;
            let docs = store.insert_many(&subject, &req.collectionname, req.items).await?;
            Ok(json!({ "result": documents(docs) }))
        }
        "updateone" => {
            let subject = signed_in(conn)?;
            let req: UpdateRequest = parse(message)?;
            let doc = if is_operator_update(&req.item) {
                let query = req
                    .query
                    .ok_or_else(|| StoreError::Validation("operator update needs a query".to_string()))?;
                let spec = UpdateSpec::from_value(&req.item)?;
                store
                    .update_one(&subject, &req.collectionname, Filter::from_query(&query)?, spec)
                    .await?
            } else {
                let item = Document::from_value(req.item)
                    .ok_or_else(|| StoreError::Validation("item must be an object".to_string()))?;
                store.replace_one(&subject, &req.collectionname, item).await?
            };
            Ok(json!({ "result": doc }))
        }
        "updatemany" => {
            let subject = signed_in(conn)?;
            let req: UpdateRequest = parse(message)?;
            let query = req.query.unwrap_or(Value::Null);
            let spec = UpdateSpec::from_value(&req.item)?;
            let docs = store
                .update_many(&subject, &req.collectionname, Filter::from_query(&query)?, spec)
                .await?;
            Ok(json!({ "result": documents(docs) }))
        }
        "insertorupdateone" => {
            let subject = signed_in(conn)?;
            let req: UpsertRequest = parse(message)?;
            let keys: Vec<String> = req
                .uniqueness
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            let doc = store
                .insert_or_update(&subject, &req.collectionname, req.item, &keys)
                .await?;
            Ok(json!({ "result": doc }))
        }
        "deleteone" => {
            let subject = signed_in(conn)?;
            let req: DeleteOneRequest = parse(message)?;
            let removed = store
                .delete_one(&subject, &req.collectionname, &req.id, req.recursive)
                .await?;
            Ok(json!({ "affectedrows": removed }))
        }
        "deletemany" => {
            let subject = signed_in(conn)?;
            let req: DeleteManyRequest = parse(message)?;
            let filter = Filter::from_query(&req.query)?;
            let removed = store
                .delete_many(&subject, &req.collectionname, filter, req.recursive)
                .await?;
            Ok(json!({ "affectedrows": removed }))
        }
        "getdocumentversion" => {
            let subject = signed_in(conn)?;
            let req: VersionRequest = parse(message)?;
            let version = req
                .version
                .ok_or_else(|| StoreError::Validation("version is required".to_string()))?;
            let doc = store
                .get_document_version(&subject, &req.collectionname, &req.id, version)
                .await?;
            Ok(json!({ "result": doc }))
        }
        "getlatestdocumentversion" => {
            let subject = signed_in(conn)?;
            let req: VersionRequest = parse(message)?;
            let doc = store
                .get_latest_document_version(&subject, &req.collectionname, &req.id)
                .await?;
            Ok(json!({ "result": doc }))
        }
        "watch" => {
            signed_in(conn)?;
            let req: WatchRequest = parse(message)?;
            let filter = WatchFilter::parse(&req.paths)?;
            let id = conn.watch(req.collectionname, filter);
            Ok(json!({ "id": id }))
        }
        "unwatch" => {
            let req: UnwatchRequest = parse(message)?;
            if !conn.unwatch(&req.id) {
                return Err(StoreError::NotFound(format!("watch {}", req.id)));
            }
            Ok(json!({}))
        }
        other => Err(StoreError::Validation(format!("unknown command {other}"))),
    }
}
