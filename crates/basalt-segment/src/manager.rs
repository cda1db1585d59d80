use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::segment::Segment;

/// Ref-counted guard over one acquired segment.
///
/// The count is decremented exactly once when the handle drops, which covers
/// every exit path of a query, including panics; a segment stays readable for
/// as long as any handle for it is live.
pub struct SegmentHandle {
    segment: Arc<dyn Segment>,
    refcount: Arc<AtomicUsize>,
}

impl SegmentHandle {
    /// The acquired segment.
    pub fn segment(&self) -> &Arc<dyn Segment> {
        &self.segment
    }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Registration {
    segment: Arc<dyn Segment>,
    refcount: Arc<AtomicUsize>,
}

/// Registry of resident segments for one table.
pub struct TableDataManager {
    table_name: String,
    segments: RwLock<HashMap<String, Registration>>,
}

impl TableDataManager {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            segments: RwLock::new(HashMap::new()),
        }
    }

    /// Table name with type suffix, e.g. `events_OFFLINE`.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Registers a segment, replacing any previous registration by that name.
    pub fn add_segment(&self, segment: Arc<dyn Segment>) {
        let name = segment.name().to_string();
        self.segments.write().insert(
            name,
            Registration {
                segment,
                refcount: Arc::new(AtomicUsize::new(0)),
            },
        );
    }

    /// Deregisters a segment. Outstanding handles keep the segment readable
    /// until they drop.
    pub fn remove_segment(&self, name: &str) -> bool {
        self.segments.write().remove(name).is_some()
    }

    /// Acquires handles for the named segments, best-effort: names not
    /// resident are simply absent from the result, so the returned list may be
    /// shorter than the request.
    pub fn acquire_segments(&self, names: &[String]) -> Vec<SegmentHandle> {
        let segments = self.segments.read();
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            if let Some(registration) = segments.get(name) {
                registration.refcount.fetch_add(1, Ordering::AcqRel);
                handles.push(SegmentHandle {
                    segment: Arc::clone(&registration.segment),
                    refcount: Arc::clone(&registration.refcount),
                });
            }
        }
        handles
    }

    /// Current handle count for a resident segment. Test/inspection hook.
    pub fn segment_refcount(&self, name: &str) -> Option<usize> {
        self.segments
            .read()
            .get(name)
            .map(|registration| registration.refcount.load(Ordering::Acquire))
    }
}

/// Registry of table data managers hosted by this server instance.
#[derive(Default)]
pub struct InstanceDataManager {
    tables: RwLock<HashMap<String, Arc<TableDataManager>>>,
}

impl InstanceDataManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table, replacing any previous registration by that name.
    pub fn register_table(&self, manager: Arc<TableDataManager>) {
        self.tables
            .write()
            .insert(manager.table_name().to_string(), manager);
    }

    /// Looks up the manager for `tableNameWithType`.
    pub fn table_data_manager(&self, table_name: &str) -> Option<Arc<TableDataManager>> {
        self.tables.read().get(table_name).cloned()
    }
}
