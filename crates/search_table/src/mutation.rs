//! Document writes against registered tables.
//!
//! Every operation commits explicitly unless the caller defers to the
//! cluster's auto-commit policy with `async_commit = true`.

use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result};
use crate::gateway::{Document, IndexGateway, QueryRequest, RemoteResponse};
use crate::lifecycle::{CollectionManager, TableContext};
use crate::row::{encode_row, ColumnSpec, Row};

/// One conditional update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRequest {
    /// Filter selecting the documents to update, in the cluster's syntax.
    pub match_filter: String,
    /// Fields set on every matched document.
    pub set_fields: Document,
    /// Document inserted when nothing matches.
    pub fallback: Option<Document>,
}

impl UpsertRequest {
    pub fn new(match_filter: impl Into<String>, set_fields: Document) -> Self {
        Self {
            match_filter: match_filter.into(),
            set_fields,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Document) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Documents touched by [`CollectionManager::upsert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub updated: usize,
    pub inserted: usize,
}

impl CollectionManager {
    /// Indexes `documents`; returns how many were sent.
    pub async fn insert_documents(
        &self,
        table: &str,
        documents: Vec<Document>,
        async_commit: bool,
    ) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }
        let context = self.context(table).await?;
        let count = documents.len();
        let gateway = context.client.gateway()?;
        let response = gateway
            .add_documents(context.collection(), documents)
            .await
            .map_err(|err| ConnectorError::mutation_transport(context.collection(), &err))?;
        check(&context, &response)?;
        self.metrics().record_documents_written(count as u64);
        self.finish(&context, gateway, async_commit).await?;
        debug!(table, documents = count, "inserted documents");
        Ok(count)
    }

    /// Encodes `rows` in `columns` order and indexes them.
    pub async fn insert_rows(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        rows: &[Row],
        async_commit: bool,
    ) -> Result<usize> {
        let documents = rows
            .iter()
            .map(|row| encode_row(columns, row))
            .collect::<Result<Vec<_>>>()?;
        self.insert_documents(table, documents, async_commit).await
    }

    /// Deletes documents by unique-key value; returns how many ids were sent.
    pub async fn delete_by_ids(&self, table: &str, ids: &[String], async_commit: bool) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let context = self.context(table).await?;
        let gateway = context.client.gateway()?;
        let response = gateway
            .delete_by_ids(context.collection(), ids)
            .await
            .map_err(|err| ConnectorError::mutation_transport(context.collection(), &err))?;
        check(&context, &response)?;
        self.metrics().record_delete_request();
        self.finish(&context, gateway, async_commit).await?;
        debug!(table, ids = ids.len(), "deleted documents by id");
        Ok(ids.len())
    }

    /// Deletes every document matching `filter`.
    pub async fn delete_by_filter(&self, table: &str, filter: &str, async_commit: bool) -> Result<()> {
        let context = self.context(table).await?;
        let gateway = context.client.gateway()?;
        let response = gateway
            .delete_by_query(context.collection(), filter)
            .await
            .map_err(|err| ConnectorError::mutation_transport(context.collection(), &err))?;
        check(&context, &response)?;
        self.metrics().record_delete_request();
        self.finish(&context, gateway, async_commit).await?;
        debug!(table, filter, "deleted documents by filter");
        Ok(())
    }

    /// Applies conditional updates. Matched documents get a partial `set`
    /// update keyed by the collection's unique key; a request with no match
    /// inserts its fallback, if any. A request whose `set_fields` name
    /// nothing but the unique key leaves its matches untouched. All writes
    /// go out as one batch, and nothing is sent when there is nothing to
    /// write.
    pub async fn upsert(
        &self,
        table: &str,
        requests: &[UpsertRequest],
        async_commit: bool,
    ) -> Result<UpsertOutcome> {
        let context = self.context(table).await?;
        let gateway = context.client.gateway()?;
        // The remote schema decides which field identifies a document.
        let unique_key = self
            .schemas()
            .current(context.schema_target())
            .await?
            .unique_key()
            .to_string();
        if unique_key != context.registration.config.unique_key {
            debug!(
                table,
                configured = %context.registration.config.unique_key,
                remote = %unique_key,
                "keying upsert on the remote unique key"
            );
        }

        let mut outcome = UpsertOutcome::default();
        let mut writes = Vec::new();
        for request in requests {
            let ids = self
                .matching_ids(&context, gateway, &request.match_filter, &unique_key)
                .await?;
            if ids.is_empty() {
                if let Some(fallback) = &request.fallback {
                    writes.push(fallback.clone());
                    outcome.inserted += 1;
                }
                continue;
            }
            let Some(updates) = settable(&unique_key, &request.set_fields) else {
                debug!(
                    table,
                    filter = %request.match_filter,
                    matched = ids.len(),
                    "upsert sets no fields; matches left unchanged"
                );
                continue;
            };
            for id in ids {
                writes.push(partial_update(&unique_key, id, &updates));
                outcome.updated += 1;
            }
        }

        if writes.is_empty() {
            debug!(table, requests = requests.len(), "upsert matched nothing");
            return Ok(outcome);
        }
        let count = writes.len();
        let response = gateway
            .add_documents(context.collection(), writes)
            .await
            .map_err(|err| ConnectorError::mutation_transport(context.collection(), &err))?;
        check(&context, &response)?;
        self.metrics().record_documents_written(count as u64);
        self.finish(&context, gateway, async_commit).await?;
        info!(
            table,
            updated = outcome.updated,
            inserted = outcome.inserted,
            "applied upsert"
        );
        Ok(outcome)
    }

    /// Issues an explicit commit on the table's collection.
    pub async fn commit(&self, table: &str) -> Result<()> {
        let context = self.context(table).await?;
        let gateway = context.client.gateway()?;
        self.finish(&context, gateway, false).await
    }

    async fn finish(
        &self,
        context: &TableContext,
        gateway: &dyn IndexGateway,
        async_commit: bool,
    ) -> Result<()> {
        if async_commit {
            return Ok(());
        }
        let response = gateway
            .commit(context.collection())
            .await
            .map_err(|err| ConnectorError::mutation_transport(context.collection(), &err))?;
        check(context, &response)?;
        self.metrics().record_commit();
        Ok(())
    }

    /// Unique-key values of every document matching `filter`, paging with
    /// the connector page size.
    async fn matching_ids(
        &self,
        context: &TableContext,
        gateway: &dyn IndexGateway,
        filter: &str,
        unique_key: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let page_size = self.config().page_size;
        let mut ids = Vec::new();
        let mut offset = 0;
        loop {
            let request = QueryRequest {
                filter: filter.to_string(),
                offset,
                rows: page_size,
                fields: vec![unique_key.to_string()],
            };
            let page = gateway
                .query(context.collection(), &request)
                .await
                .map_err(|err| ConnectorError::mutation_transport(context.collection(), &err))?;
            let fetched = page.docs.len();
            ids.extend(page.docs.into_iter().filter_map(|mut doc| doc.remove(unique_key)));
            if fetched < page_size {
                return Ok(ids);
            }
            offset += fetched;
        }
    }
}

fn check(context: &TableContext, response: &RemoteResponse) -> Result<()> {
    if response.is_success() {
        return Ok(());
    }
    warn!(
        collection = context.collection(),
        status = response.status,
        errors = ?response.messages(),
        "mutation rejected"
    );
    Err(ConnectorError::mutation(context.collection(), response))
}

/// `set_fields` without the unique key, or `None` when nothing is left to set.
fn settable(unique_key: &str, set_fields: &Document) -> Option<Document> {
    let fields = set_fields
        .iter()
        .filter(|(field, _)| field.as_str() != unique_key)
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect::<Document>();
    (!fields.is_empty()).then_some(fields)
}

fn partial_update(unique_key: &str, id: serde_json::Value, updates: &Document) -> Document {
    let mut document = Document::new();
    document.insert(unique_key.to_string(), id);
    for (field, value) in updates {
        document.insert(field.clone(), serde_json::json!({ "set": value }));
    }
    document
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{partial_update, settable};

    #[test]
    fn partial_update_wraps_fields_in_set_and_keeps_key() {
        let set = json!({"price": 12.5, "id": "ignored"}).as_object().cloned().unwrap();
        let updates = settable("id", &set).unwrap();
        let doc = partial_update("id", json!("42"), &updates);
        assert_eq!(
            serde_json::Value::Object(doc),
            json!({"id": "42", "price": {"set": 12.5}})
        );
    }

    #[test]
    fn key_only_or_empty_set_fields_have_nothing_to_set() {
        let key_only = json!({"id": "42"}).as_object().cloned().unwrap();
        assert!(settable("id", &key_only).is_none());
        assert!(settable("id", &serde_json::Map::new()).is_none());
    }
}
