use basalt_common::{DataTable, Result};
use parking_lot::Mutex;

/// Transport-facing sink for response tables.
///
/// Streaming requests receive zero or more data tables followed by one
/// metadata-only table; non-streaming requests receive a single combined
/// table. An error from the sink is fatal to the request and surfaces as an
/// out-of-band `INTERNAL` failure.
pub trait StreamObserver: Send + Sync {
    /// Delivers one response table.
    fn on_data(&self, table: &DataTable) -> Result<()>;
}

/// Observer that buffers everything it receives. Used by in-process callers
/// and tests.
#[derive(Default)]
pub struct BufferingObserver {
    tables: Mutex<Vec<DataTable>>,
}

impl BufferingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables received so far, in delivery order.
    pub fn tables(&self) -> Vec<DataTable> {
        self.tables.lock().clone()
    }

    /// The final (metadata) table, when any were delivered.
    pub fn last_table(&self) -> Option<DataTable> {
        self.tables.lock().last().cloned()
    }
}

impl StreamObserver for BufferingObserver {
    fn on_data(&self, table: &DataTable) -> Result<()> {
        self.tables.lock().push(table.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_in_delivery_order() {
        let observer = BufferingObserver::new();
        let mut first = DataTable::empty();
        first.set_metadata("numSegmentsQueried", 1_u64);
        observer.on_data(&first).unwrap();
        observer.on_data(&DataTable::empty()).unwrap();
        assert_eq!(observer.tables().len(), 2);
        assert_eq!(observer.tables()[0], first);
        assert_eq!(observer.last_table(), Some(DataTable::empty()));
    }
}
