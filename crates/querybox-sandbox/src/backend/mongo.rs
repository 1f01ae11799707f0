//! MongoDB client over the official driver.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, UpdateModifications};
use mongodb::{Client, Collection, Database};
use serde_json::Value;

use crate::adapter::{DocumentClient, DocumentOp, DocumentReply};
use crate::error::DbError;

const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// One MongoDB client bound to a database.
pub struct MongoClient {
    client: Client,
    db: Database,
}

impl MongoClient {
    /// Parse the URI, connect, and ping the database.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, DbError> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;
        options.app_name = Some("querybox".into());
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        options.connect_timeout = Some(SERVER_SELECTION_TIMEOUT);

        let client =
            Client::with_options(options).map_err(|e| DbError::Connection(e.to_string()))?;
        let db = client.database(database);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        tracing::debug!(database, "mongodb: connected");
        Ok(Self { client, db })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }
}

#[async_trait]
impl DocumentClient for MongoClient {
    async fn execute(&self, collection: &str, op: DocumentOp) -> Result<DocumentReply, DbError> {
        let coll = self.collection(collection);
        let reply = match op {
            DocumentOp::Find { filter, options } => {
                let mut find = coll.find(to_document(filter)?);
                if let Some(limit) = options.limit {
                    find = find.limit(i64::try_from(limit).unwrap_or(i64::MAX));
                }
                if let Some(skip) = options.skip {
                    find = find.skip(skip);
                }
                if let Some(sort) = options.sort {
                    find = find.sort(to_document(sort)?);
                }
                if let Some(projection) = options.projection {
                    find = find.projection(to_document(projection)?);
                }
                let docs: Vec<Document> = find
                    .await
                    .map_err(mongo_error)?
                    .try_collect()
                    .await
                    .map_err(mongo_error)?;
                DocumentReply::Documents(docs.into_iter().map(to_json).collect())
            }
            DocumentOp::FindOne { filter, projection } => {
                let mut find = coll.find_one(to_document(filter)?);
                if let Some(projection) = projection {
                    find = find.projection(to_document(projection)?);
                }
                let doc = find.await.map_err(mongo_error)?;
                DocumentReply::Document(doc.map(to_json))
            }
            DocumentOp::InsertOne { document } => {
                let result = coll
                    .insert_one(to_document(document)?)
                    .await
                    .map_err(mongo_error)?;
                DocumentReply::Inserted {
                    ids: vec![bson_to_json(result.inserted_id)],
                }
            }
            DocumentOp::InsertMany { documents } => {
                let docs = documents
                    .into_iter()
                    .map(to_document)
                    .collect::<Result<Vec<_>, _>>()?;
                let result = coll.insert_many(docs).await.map_err(mongo_error)?;
                let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
                ids.sort_by_key(|(i, _)| *i);
                DocumentReply::Inserted {
                    ids: ids.into_iter().map(|(_, id)| bson_to_json(id)).collect(),
                }
            }
            DocumentOp::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                let result = coll
                    .update_one(to_document(filter)?, to_update(update)?)
                    .upsert(upsert)
                    .await
                    .map_err(mongo_error)?;
                DocumentReply::Updated {
                    matched: result.matched_count,
                    modified: result.modified_count,
                    upserted_id: result.upserted_id.map(bson_to_json),
                }
            }
            DocumentOp::UpdateMany {
                filter,
                update,
                upsert,
            } => {
                let result = coll
                    .update_many(to_document(filter)?, to_update(update)?)
                    .upsert(upsert)
                    .await
                    .map_err(mongo_error)?;
                DocumentReply::Updated {
                    matched: result.matched_count,
                    modified: result.modified_count,
                    upserted_id: result.upserted_id.map(bson_to_json),
                }
            }
            DocumentOp::DeleteOne { filter } => {
                let result = coll
                    .delete_one(to_document(filter)?)
                    .await
                    .map_err(mongo_error)?;
                DocumentReply::Deleted(result.deleted_count)
            }
            DocumentOp::DeleteMany { filter } => {
                let result = coll
                    .delete_many(to_document(filter)?)
                    .await
                    .map_err(mongo_error)?;
                DocumentReply::Deleted(result.deleted_count)
            }
            DocumentOp::CountDocuments { filter } => {
                let n = coll
                    .count_documents(to_document(filter)?)
                    .await
                    .map_err(mongo_error)?;
                DocumentReply::Count(n)
            }
            DocumentOp::Aggregate { pipeline } => {
                let stages = pipeline
                    .into_iter()
                    .map(to_document)
                    .collect::<Result<Vec<_>, _>>()?;
                let docs: Vec<Document> = coll
                    .aggregate(stages)
                    .await
                    .map_err(mongo_error)?
                    .try_collect()
                    .await
                    .map_err(mongo_error)?;
                DocumentReply::Documents(docs.into_iter().map(to_json).collect())
            }
            DocumentOp::CreateIndex { keys, options } => {
                let keys = to_document(keys)?;
                let name = match options.get("name").and_then(Value::as_str) {
                    Some(name) => name.to_string(),
                    None => default_index_name(&keys),
                };
                let mut index = to_document(Value::Object(options))?;
                index.insert("key", keys);
                index.insert("name", name.clone());
                self.db
                    .run_command(doc! { "createIndexes": collection, "indexes": [index] })
                    .await
                    .map_err(mongo_error)?;
                DocumentReply::IndexName(name)
            }
            DocumentOp::DropIndex { name } => {
                self.db
                    .run_command(doc! { "dropIndexes": collection, "index": name })
                    .await
                    .map_err(mongo_error)?;
                DocumentReply::Acknowledged
            }
            DocumentOp::ListIndexes => {
                let reply = self
                    .db
                    .run_command(doc! { "listIndexes": collection })
                    .await
                    .map_err(mongo_error)?;
                let batch = reply
                    .get_document("cursor")
                    .and_then(|c| c.get_array("firstBatch"))
                    .map_err(|e| DbError::query(e.to_string(), None))?;
                DocumentReply::Indexes(batch.iter().cloned().map(bson_to_json).collect())
            }
            DocumentOp::Drop => {
                coll.drop().await.map_err(mongo_error)?;
                DocumentReply::Acknowledged
            }
        };
        Ok(reply)
    }

    async fn list_collections(&self) -> Result<Vec<String>, DbError> {
        let mut names = self.db.list_collection_names().await.map_err(mongo_error)?;
        names.sort();
        Ok(names)
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

/// Driver-style default index name: `field_1_other_-1`.
fn default_index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, dir)| match dir {
            Bson::String(s) => format!("{field}_{s}"),
            other => format!("{field}_{other}"),
        })
        .collect::<Vec<_>>()
        .join("_")
}

fn to_document(value: Value) -> Result<Document, DbError> {
    match Bson::try_from(value) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(other) => Err(DbError::InvalidArgument(format!(
            "expected a document, got {other}"
        ))),
        Err(e) => Err(DbError::InvalidArgument(e.to_string())),
    }
}

fn to_update(value: Value) -> Result<UpdateModifications, DbError> {
    match value {
        Value::Array(stages) => Ok(UpdateModifications::Pipeline(
            stages
                .into_iter()
                .map(to_document)
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(UpdateModifications::Document(to_document(other)?)),
    }
}

fn to_json(doc: Document) -> Value {
    bson_to_json(Bson::Document(doc))
}

/// Relaxed extended JSON. ObjectIds stay `{"$oid": ...}` so a fetched `_id`
/// can be passed straight back as a filter.
fn bson_to_json(value: Bson) -> Value {
    value.into_relaxed_extjson()
}

fn mongo_error(e: MongoError) -> DbError {
    let code = match e.kind.as_ref() {
        ErrorKind::Command(c) => Some(c.code.to_string()),
        ErrorKind::Write(WriteFailure::WriteError(w)) => Some(w.code.to_string()),
        _ => None,
    };
    DbError::query(e.to_string(), code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;

    #[test]
    fn object_ids_keep_their_extended_form() {
        let oid = ObjectId::new();
        let value = bson_to_json(Bson::Document(doc! { "_id": oid, "tags": [oid] }));
        assert_eq!(value["_id"], json!({ "$oid": oid.to_hex() }));
        assert_eq!(value["tags"][0], json!({ "$oid": oid.to_hex() }));
    }

    #[test]
    fn fetched_ids_filter_back_to_the_same_document() {
        let oid = ObjectId::new();
        let fetched = bson_to_json(Bson::Document(doc! { "_id": oid, "n": 1 }));
        let filter = to_document(json!({ "_id": fetched["_id"].clone() })).unwrap();
        assert_eq!(filter.get_object_id("_id").unwrap(), oid);
    }

    #[test]
    fn extended_json_filters_convert() {
        let doc = to_document(json!({"_id": {"$oid": "65f1a9d2c3b4a5968778695a"}, "n": {"$gt": 3}}))
            .unwrap();
        assert!(matches!(doc.get("_id"), Some(Bson::ObjectId(_))));
        assert!(doc.get_document("n").is_ok());
    }

    #[test]
    fn non_documents_are_rejected() {
        assert!(to_document(json!([1, 2])).is_err());
        assert!(to_update(json!("x")).is_err());
        assert!(matches!(
            to_update(json!([{"$set": {"a": 1}}])).unwrap(),
            UpdateModifications::Pipeline(_)
        ));
    }

    #[test]
    fn index_names_follow_driver_convention() {
        assert_eq!(default_index_name(&doc! { "email": 1, "age": -1 }), "email_1_age_-1");
        assert_eq!(default_index_name(&doc! { "body": "text" }), "body_text");
    }
}
