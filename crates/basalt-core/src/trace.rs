use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;

static TRACES: OnceLock<Mutex<HashMap<u64, Vec<String>>>> = OnceLock::new();

fn traces() -> &'static Mutex<HashMap<u64, Vec<String>>> {
    TRACES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Process-wide per-request trace registry.
///
/// Registration and unregistration are paired by the executor; entries logged
/// for an unregistered request id are dropped.
pub struct TraceContext;

impl TraceContext {
    /// Opens trace collection for a request.
    pub fn register(request_id: u64) {
        traces().lock().insert(request_id, Vec::new());
    }

    /// Appends a trace entry when the request is registered.
    pub fn log(request_id: u64, entry: impl Into<String>) {
        if let Some(entries) = traces().lock().get_mut(&request_id) {
            entries.push(entry.into());
        }
    }

    /// Renders the collected entries for attachment to response metadata.
    pub fn trace_info(request_id: u64) -> String {
        traces()
            .lock()
            .get(&request_id)
            .map(|entries| entries.join(";"))
            .unwrap_or_default()
    }

    /// Closes trace collection for a request.
    pub fn unregister(request_id: u64) {
        traces().lock().remove(&request_id);
    }

    /// Whether a request is currently registered. Test/inspection hook.
    pub fn is_registered(request_id: u64) -> bool {
        traces().lock().contains_key(&request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_log_render_unregister() {
        TraceContext::register(99);
        TraceContext::log(99, "SEGMENT_PRUNING=1ms");
        TraceContext::log(99, "QUERY_PLAN_EXECUTION=5ms");
        assert_eq!(
            TraceContext::trace_info(99),
            "SEGMENT_PRUNING=1ms;QUERY_PLAN_EXECUTION=5ms"
        );
        TraceContext::unregister(99);
        assert!(!TraceContext::is_registered(99));
        assert_eq!(TraceContext::trace_info(99), "");
    }

    #[test]
    fn unregistered_requests_drop_entries() {
        TraceContext::log(12345, "ignored");
        assert_eq!(TraceContext::trace_info(12345), "");
    }
}
