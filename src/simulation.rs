//! In-memory spreadsheet backend
//!
//! Implements both collaborator interfaces the coordinator consumes, so the
//! whole commit path can run without a network. Every call is recorded in
//! arrival order, and failures can be scripted per range or per call index.
//! An optional concurrency ceiling answers 429 the way the real API does
//! under load.

use crate::batcher::{deep_merge, GridRange, RemoteCall};
use crate::retry::RemoteError;
use crate::transaction::{RemoteApiClient, SnapshotError, SnapshotGateway, SnapshotHandle};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Contents of one range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    pub value: Option<Value>,
    pub format: Value,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            value: None,
            format: Value::Object(Map::new()),
        }
    }
}

/// Everything stored for one spreadsheet
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceState {
    /// Keyed by canonical range text; `""` is the whole resource
    pub cells: BTreeMap<String, Cell>,
    pub sheets: BTreeSet<String>,
}

/// A call as the backend received it
#[derive(Debug, Clone, Serialize)]
pub struct RecordedCall {
    pub index: usize,
    pub handler: String,
    pub actions: Vec<String>,
    pub resource_id: String,
    pub range: Option<String>,
    pub sequence_numbers: Vec<u64>,
    pub params: Value,
    pub error: Option<RemoteError>,
}

impl RecordedCall {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
struct RangeFault {
    range: String,
    error: RemoteError,
    /// `u32::MAX` never runs out
    remaining: u32,
}

#[derive(Debug, Default)]
struct SimState {
    resources: HashMap<String, ResourceState>,
    snapshots: HashMap<String, (String, ResourceState)>,
    calls: Vec<RecordedCall>,
    range_faults: Vec<RangeFault>,
    call_faults: HashMap<usize, RemoteError>,
    latency: Option<(Duration, Duration)>,
    concurrency_ceiling: Option<usize>,
    fail_captures: bool,
    fail_restores: bool,
    next_snapshot: u64,
    throttled: usize,
}

impl SimState {
    fn scripted_fault(&mut self, index: usize, range: &str) -> Option<RemoteError> {
        if let Some(error) = self.call_faults.remove(&index) {
            return Some(error);
        }

        let fault = self
            .range_faults
            .iter_mut()
            .find(|fault| fault.range == range && fault.remaining > 0)?;
        if fault.remaining != u32::MAX {
            fault.remaining -= 1;
        }
        Some(fault.error.clone())
    }
}

/// Canonical cell-map key for an optional range
fn range_key(range: Option<&str>) -> String {
    match range {
        None => String::new(),
        Some(text) => GridRange::parse(text)
            .map(|r| r.to_string())
            .unwrap_or_else(|| text.trim().to_string()),
    }
}

#[derive(Debug, Default)]
pub struct InMemorySheets {
    state: Mutex<SimState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemorySheets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-call latency drawn uniformly from `[min, max]`
    pub fn set_latency(&self, latency: Option<(Duration, Duration)>) {
        self.state.lock().latency = latency;
    }

    /// Answer 429 while more than `ceiling` calls are in flight
    pub fn set_concurrency_ceiling(&self, ceiling: Option<usize>) {
        self.state.lock().concurrency_ceiling = ceiling;
    }

    /// Fail the next `times` calls on `range` with `error`
    pub fn inject_range_failure(&self, range: &str, error: RemoteError, times: u32) {
        self.state.lock().range_faults.push(RangeFault {
            range: range_key(Some(range)),
            error,
            remaining: times,
        });
    }

    /// Fail the call with 0-based arrival `index`
    pub fn inject_call_failure(&self, index: usize, error: RemoteError) {
        self.state.lock().call_faults.insert(index, error);
    }

    pub fn fail_captures(&self, fail: bool) {
        self.state.lock().fail_captures = fail;
    }

    pub fn fail_restores(&self, fail: bool) {
        self.state.lock().fail_restores = fail;
    }

    pub fn seed_value(&self, resource_id: &str, range: &str, value: Value) {
        let mut state = self.state.lock();
        let resource = state.resources.entry(resource_id.to_string()).or_default();
        resource.cells.entry(range_key(Some(range))).or_default().value = Some(value);
    }

    pub fn cell(&self, resource_id: &str, range: &str) -> Option<Cell> {
        let state = self.state.lock();
        state
            .resources
            .get(resource_id)?
            .cells
            .get(&range_key(Some(range)))
            .cloned()
    }

    pub fn resource_state(&self, resource_id: &str) -> ResourceState {
        self.state
            .lock()
            .resources
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// How many received calls carried operation `sequence_number`
    pub fn calls_for_sequence(&self, resource_id: &str, sequence_number: u64) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.resource_id == resource_id && c.sequence_numbers.contains(&sequence_number))
            .count()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    /// Calls answered 429 by the concurrency ceiling
    pub fn throttled_calls(&self) -> usize {
        self.state.lock().throttled
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn apply(resource: &mut ResourceState, call: &RemoteCall, key: &str) -> Result<Value, RemoteError> {
        match call.handler.as_str() {
            "format" => {
                let cell = resource.cells.entry(key.to_string()).or_default();
                deep_merge(&mut cell.format, &call.params);
                Ok(json!({ "updatedRange": key, "format": cell.format }))
            }
            "values" => match call.action() {
                "write" | "update" => {
                    let value = call.params.get("values").cloned().unwrap_or_else(|| call.params.clone());
                    resource.cells.entry(key.to_string()).or_default().value = Some(value);
                    Ok(json!({ "updatedRange": key }))
                }
                "clear" => {
                    if let Some(cell) = resource.cells.get_mut(key) {
                        cell.value = None;
                    }
                    Ok(json!({ "clearedRange": key }))
                }
                other => Err(RemoteError::BadRequest {
                    message: format!("unsupported values action '{}'", other),
                }),
            },
            "sheet" => {
                let title = call
                    .params
                    .get("title")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RemoteError::BadRequest {
                        message: "sheet operations need a title".to_string(),
                    })?
                    .to_string();

                match call.action() {
                    "add" => {
                        if !resource.sheets.insert(title.clone()) {
                            return Err(RemoteError::BadRequest {
                                message: format!("sheet '{}' already exists", title),
                            });
                        }
                        Ok(json!({ "added": title }))
                    }
                    "delete" => {
                        if !resource.sheets.remove(&title) {
                            return Err(RemoteError::NotFound {
                                message: format!("sheet '{}' does not exist", title),
                            });
                        }
                        Ok(json!({ "deleted": title }))
                    }
                    other => Err(RemoteError::BadRequest {
                        message: format!("unsupported sheet action '{}'", other),
                    }),
                }
            }
            other => Err(RemoteError::BadRequest {
                message: format!("unknown handler '{}'", other),
            }),
        }
    }
}

#[async_trait]
impl RemoteApiClient for InMemorySheets {
    async fn invoke(&self, call: &RemoteCall) -> Result<Value, RemoteError> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = scopeguard::guard((), |_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        self.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let (latency, ceiling) = {
            let state = self.state.lock();
            (state.latency, state.concurrency_ceiling)
        };

        let throttled = ceiling.is_some_and(|ceiling| in_flight > ceiling);
        if !throttled {
            if let Some((min, max)) = latency {
                let millis = fastrand::u64(min.as_millis() as u64..=max.as_millis().max(min.as_millis()) as u64);
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
        }

        let key = range_key(call.range.as_deref());
        let mut state = self.state.lock();
        let index = state.calls.len();

        let result = if throttled {
            state.throttled += 1;
            Err(RemoteError::rate_limited("Too many concurrent requests"))
        } else {
            match state.scripted_fault(index, &key) {
                Some(error) => Err(error),
                None => {
                    let resource = state.resources.entry(call.resource_id.clone()).or_default();
                    Self::apply(resource, call, &key)
                }
            }
        };

        trace!(index, call = %call.label(), ok = result.is_ok(), "Simulated call");
        state.calls.push(RecordedCall {
            index,
            handler: call.handler.clone(),
            actions: call.actions.iter().cloned().collect(),
            resource_id: call.resource_id.clone(),
            range: call.range.clone(),
            sequence_numbers: call.sequence_numbers.iter().copied().collect(),
            params: call.params.clone(),
            error: result.as_ref().err().cloned(),
        });

        result
    }
}

#[async_trait]
impl SnapshotGateway for InMemorySheets {
    async fn capture(&self, resource_id: &str) -> Result<SnapshotHandle, SnapshotError> {
        let mut state = self.state.lock();
        if state.fail_captures {
            return Err(SnapshotError::CaptureFailed {
                resource_id: resource_id.to_string(),
                message: "copy request rejected".to_string(),
            });
        }

        state.next_snapshot += 1;
        let snapshot_id = format!("snap_{}_{}", resource_id, state.next_snapshot);
        let copy = state.resources.get(resource_id).cloned().unwrap_or_default();
        state
            .snapshots
            .insert(snapshot_id.clone(), (resource_id.to_string(), copy));

        debug!(resource_id = %resource_id, snapshot_id = %snapshot_id, "Simulated snapshot captured");
        Ok(SnapshotHandle {
            snapshot_id,
            resource_id: resource_id.to_string(),
            captured_at: Utc::now(),
        })
    }

    async fn restore(&self, handle: &SnapshotHandle) -> Result<String, SnapshotError> {
        let mut state = self.state.lock();
        if state.fail_restores {
            return Err(SnapshotError::RestoreFailed {
                snapshot_id: handle.snapshot_id.clone(),
                message: "restore request rejected".to_string(),
            });
        }

        let (resource_id, copy) = state
            .snapshots
            .get(&handle.snapshot_id)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(handle.snapshot_id.clone()))?;
        state.resources.insert(resource_id.clone(), copy);

        debug!(resource_id = %resource_id, snapshot_id = %handle.snapshot_id, "Simulated snapshot restored");
        Ok(resource_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonempty::NonEmpty;

    fn call(handler: &str, action: &str, range: Option<&str>, params: Value) -> RemoteCall {
        RemoteCall {
            handler: handler.to_string(),
            actions: NonEmpty::new(action.to_string()),
            resource_id: "sheet-1".to_string(),
            range: range.map(str::to_string),
            params,
            sequence_numbers: NonEmpty::new(1),
        }
    }

    #[tokio::test]
    async fn test_format_deep_merges() {
        let sheets = InMemorySheets::new();
        sheets
            .invoke(&call("format", "set", Some("A1:B2"), json!({ "text": { "bold": true } })))
            .await
            .unwrap();
        sheets
            .invoke(&call("format", "set", Some("a1:b2"), json!({ "text": { "italic": true } })))
            .await
            .unwrap();

        let cell = sheets.cell("sheet-1", "A1:B2").unwrap();
        assert_eq!(cell.format, json!({ "text": { "bold": true, "italic": true } }));
        assert_eq!(sheets.call_count(), 2);
    }

    #[tokio::test]
    async fn test_values_and_sheets() {
        let sheets = InMemorySheets::new();
        sheets
            .invoke(&call("values", "write", Some("C3"), json!({ "values": [[7]] })))
            .await
            .unwrap();
        assert_eq!(sheets.cell("sheet-1", "C3").unwrap().value, Some(json!([[7]])));

        sheets.invoke(&call("values", "clear", Some("C3"), json!({}))).await.unwrap();
        assert_eq!(sheets.cell("sheet-1", "C3").unwrap().value, None);

        sheets
            .invoke(&call("sheet", "add", None, json!({ "title": "Summary" })))
            .await
            .unwrap();
        let duplicate = sheets
            .invoke(&call("sheet", "add", None, json!({ "title": "Summary" })))
            .await
            .unwrap_err();
        assert!(!duplicate.is_retryable());
        assert!(sheets.resource_state("sheet-1").sheets.contains("Summary"));
    }

    #[tokio::test]
    async fn test_scripted_faults() {
        let sheets = InMemorySheets::new();
        sheets.inject_range_failure(
            "A5",
            RemoteError::Unavailable {
                message: "backend".to_string(),
            },
            2,
        );
        sheets.inject_call_failure(0, RemoteError::rate_limited("quota"));

        let op = call("values", "write", Some("A1"), json!({ "values": [[1]] }));
        assert!(sheets.invoke(&op).await.unwrap_err().is_rate_limit());
        assert!(sheets.invoke(&op).await.is_ok());

        let target = call("values", "write", Some("A5"), json!({ "values": [[5]] }));
        assert!(sheets.invoke(&target).await.is_err());
        assert!(sheets.invoke(&target).await.is_err());
        assert!(sheets.invoke(&target).await.is_ok());

        let outcomes: Vec<bool> = sheets.calls().iter().map(RecordedCall::succeeded).collect();
        assert_eq!(outcomes, vec![false, true, false, false, true]);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let sheets = InMemorySheets::new();
        sheets.seed_value("sheet-1", "A1", json!(1));

        let handle = sheets.capture("sheet-1").await.unwrap();
        sheets.seed_value("sheet-1", "A1", json!(2));
        assert_eq!(sheets.restore(&handle).await.unwrap(), "sheet-1");
        assert_eq!(sheets.cell("sheet-1", "A1").unwrap().value, Some(json!(1)));

        sheets.fail_captures(true);
        assert!(sheets.capture("sheet-1").await.is_err());
        sheets.fail_restores(true);
        assert!(sheets.restore(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let sheets = std::sync::Arc::new(InMemorySheets::new());
        sheets.set_concurrency_ceiling(Some(2));
        sheets.set_latency(Some((Duration::from_millis(20), Duration::from_millis(20))));

        let tasks: Vec<_> = (0..6)
            .map(|row| {
                let sheets = sheets.clone();
                tokio::spawn(async move {
                    let range = format!("A{}", row + 1);
                    sheets
                        .invoke(&call("values", "write", Some(&range), json!({ "values": [[row]] })))
                        .await
                })
            })
            .collect();

        let mut throttled = 0;
        for task in futures::future::join_all(tasks).await {
            if let Err(err) = task.unwrap() {
                assert!(err.is_rate_limit());
                throttled += 1;
            }
        }

        assert!(throttled > 0);
        assert_eq!(throttled, sheets.throttled_calls());
    }
}
