use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use cloud_gax::grpc::Status;

use crate::apiv1::rpc::{Field, PartialResultSet, ResultSetMetadata, ResultSetStats, Streaming, Transaction};
use crate::row::Row;

/// Rows of a streaming query or read.
///
/// The first chunk is fetched on creation so that the column metadata, and the id of
/// a transaction begun inline, are known before the first row is consumed.
pub struct RowIterator {
    streaming: Streaming,
    fields: Arc<Vec<Field>>,
    index: Arc<HashMap<String, usize>>,
    transaction: Option<Transaction>,
    rows: VecDeque<Row>,
    stats: Option<ResultSetStats>,
    done: bool,
}

impl RowIterator {
    pub(crate) async fn new(mut streaming: Streaming) -> Result<RowIterator, Status> {
        let first = streaming.message().await?;
        let metadata = first.as_ref().and_then(|r| r.metadata.clone()).unwrap_or_default();
        let ResultSetMetadata { row_type, transaction } = metadata;
        let index = row_type
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect::<HashMap<String, usize>>();
        let mut iter = RowIterator {
            streaming,
            fields: Arc::new(row_type),
            index: Arc::new(index),
            transaction,
            rows: VecDeque::new(),
            stats: None,
            done: first.is_none(),
        };
        if let Some(first) = first {
            iter.push(first);
        }
        Ok(iter)
    }

    fn push(&mut self, chunk: PartialResultSet) {
        for values in chunk.rows {
            self.rows
                .push_back(Row::new(self.index.clone(), self.fields.clone(), values.values));
        }
        if chunk.stats.is_some() {
            self.stats = chunk.stats;
        }
    }

    pub fn columns_metadata(&self) -> &Arc<Vec<Field>> {
        &self.fields
    }

    pub fn column_metadata(&self, column_name: &str) -> Option<(usize, Field)> {
        self.index
            .get(column_name)
            .map(|i| (*i, self.fields[*i].clone()))
    }

    /// Only available once every row was consumed.
    pub fn stats(&self) -> Option<&ResultSetStats> {
        self.stats.as_ref()
    }

    pub(crate) fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub async fn next(&mut self) -> Result<Option<Row>, Status> {
        loop {
            if let Some(row) = self.rows.pop_front() {
                return Ok(Some(row));
            }
            if self.done {
                return Ok(None);
            }
            match self.streaming.message().await? {
                Some(chunk) => self.push(chunk),
                None => self.done = true,
            }
        }
    }
}
