//! In-process [`ItemStore`] with scan paging, limited batch capacity and
//! scripted failures.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::codec::{AttributeValue, Item};
use crate::transport::{
    ItemStore, Operation, ScanPage, ScanRequest, TransportError, UpdateRequest,
};

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Default)]
struct State {
    /// table name -> partition key -> item
    tables: HashMap<String, BTreeMap<String, Item>>,
    calls: HashMap<Operation, usize>,
    /// (operation, 1-based call number) -> error returned by that call
    faults: HashMap<(Operation, usize), TransportError>,
}

pub struct MemoryStore {
    partition_key: String,
    page_size: usize,
    write_capacity: Option<usize>,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            page_size: DEFAULT_PAGE_SIZE,
            write_capacity: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Items evaluated per scan page when the request sets no limit
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Items applied per batch write; the rest come back unprocessed
    pub fn with_write_capacity(mut self, capacity: usize) -> Self {
        self.write_capacity = Some(capacity);
        self
    }

    /// Make the `nth` call (1-based) of `operation` fail with `error`
    pub async fn fail_call(&self, operation: Operation, nth: usize, error: TransportError) {
        self.state.lock().await.faults.insert((operation, nth), error);
    }

    pub async fn calls(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    pub async fn item_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    fn partition_value(&self, item: &Item) -> Result<String, TransportError> {
        item.get(&self.partition_key)
            .and_then(AttributeValue::as_s)
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::service(
                    "ValidationException",
                    Some(400),
                    format!(
                        "missing or non-string partition key attribute {}",
                        self.partition_key
                    ),
                )
            })
    }
}

impl State {
    /// Count the call and return its scripted failure, if any
    fn begin(&mut self, operation: Operation) -> Result<(), TransportError> {
        let count = self.calls.entry(operation).or_insert(0);
        *count += 1;
        match self.faults.remove(&(operation, *count)) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn table(&mut self, table: &str) -> &mut BTreeMap<String, Item> {
        self.tables.entry(table.to_string()).or_default()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn put_item(&self, table: &str, item: Item) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.begin(Operation::PutItem)?;
        let key = self.partition_value(&item)?;
        state.table(table).insert(key, item);
        Ok(())
    }

    async fn get_item(&self, table: &str, key: Item) -> Result<Option<Item>, TransportError> {
        let mut state = self.state.lock().await;
        state.begin(Operation::GetItem)?;
        let key = self.partition_value(&key)?;
        Ok(state.table(table).get(&key).cloned())
    }

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        update: UpdateRequest,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.begin(Operation::UpdateItem)?;
        let partition = self.partition_value(&key)?;
        let rows = state.table(table);

        if let Some(attribute) = &update.require_existing {
            let satisfied = rows
                .get(&partition)
                .is_some_and(|item| item.contains_key(attribute));
            if !satisfied {
                return Err(TransportError::service(
                    "ConditionalCheckFailedException",
                    Some(400),
                    "The conditional request failed",
                ));
            }
        }

        let item = rows.entry(partition).or_insert_with(|| key);
        for (attribute, value) in update.set {
            item.insert(attribute, value);
        }
        Ok(())
    }

    async fn delete_item(&self, table: &str, key: Item) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.begin(Operation::DeleteItem)?;
        let key = self.partition_value(&key)?;
        state.table(table).remove(&key);
        Ok(())
    }

    async fn scan(&self, table: &str, request: ScanRequest) -> Result<ScanPage, TransportError> {
        let mut state = self.state.lock().await;
        state.begin(Operation::Scan)?;

        let start = match &request.exclusive_start_key {
            Some(key) => Bound::Excluded(self.partition_value(key)?),
            None => Bound::Unbounded,
        };
        let limit = match request.limit {
            Some(limit) if limit > 0 => limit as usize,
            _ => self.page_size,
        };

        let rows = state.table(table);
        let evaluated: Vec<(&String, &Item)> =
            rows.range((start, Bound::Unbounded)).take(limit).collect();

        let last_evaluated_key = if evaluated.len() == limit {
            evaluated.last().map(|(partition, _)| {
                Item::from([(
                    self.partition_key.clone(),
                    AttributeValue::S(partition.to_string()),
                )])
            })
        } else {
            None
        };

        let items = evaluated
            .into_iter()
            .map(|(_, item)| item)
            .filter(|item| request.filter.as_ref().is_none_or(|f| f.matches(item)))
            .cloned()
            .collect();

        Ok(ScanPage {
            items,
            last_evaluated_key,
        })
    }

    async fn batch_put(&self, table: &str, items: Vec<Item>) -> Result<Vec<Item>, TransportError> {
        let mut state = self.state.lock().await;
        state.begin(Operation::BatchWriteItem)?;

        if items.len() > crate::repository::BATCH_WRITE_LIMIT {
            return Err(TransportError::service(
                "ValidationException",
                Some(400),
                "Too many items requested for the BatchWriteItem call",
            ));
        }

        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            keyed.push((self.partition_value(&item)?, item));
        }

        let capacity = self.write_capacity.unwrap_or(keyed.len());
        let unprocessed = keyed.split_off(capacity.min(keyed.len()));
        let rows = state.table(table);
        for (partition, item) in keyed {
            rows.insert(partition, item);
        }
        Ok(unprocessed.into_iter().map(|(_, item)| item).collect())
    }
}
