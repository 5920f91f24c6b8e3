//! Decoder worker: one long-running task per physical BTS.
//!
//! Owns the segmenter and parser for one dissector stream and folds every
//! valid measurement report into a per-channel strength summary. The
//! controller talks to a running worker only through its [`DecoderHandle`]:
//! current serving channel, last advertised neighbor list, the weighted RSSI
//! snapshot, and a drain-once log of raw reports.
//!
//! Store writes are non-critical and go through a write-behind queue that is
//! flushed once per record, so a contended database never stalls parsing.

use crate::gsm::{MeasurementReport, RecordKind, SysInfo2, TapHeader};
use crate::store::ObservationStore;
use crate::stream::RecordStream;
use crate::types::{Arfcn, RECENT_WINDOW, REPORT_LIST_CAP};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Observation store shared between workers and the controller. One lock
/// serializes every read and write, including the expiry scan.
pub type SharedStore = Arc<Mutex<ObservationStore>>;

/// Lock-guarded bounded report list with drain-once semantics: `drain`
/// atomically swaps in a fresh container, so every report is observed at most
/// once and a slow consumer only ever loses the oldest entries.
pub struct ReportLog {
    reports: Mutex<VecDeque<MeasurementReport>>,
    cap: usize,
}

impl ReportLog {
    pub fn new(cap: usize) -> Self {
        Self {
            reports: Mutex::new(VecDeque::new()),
            cap,
        }
    }

    pub async fn put(&self, report: MeasurementReport) {
        let mut reports = self.reports.lock().await;
        if reports.len() == self.cap {
            reports.pop_front();
        }
        reports.push_back(report);
    }

    pub async fn drain(&self) -> Vec<MeasurementReport> {
        let mut reports = self.reports.lock().await;
        std::mem::take(&mut *reports).into()
    }
}

/// Store mutation deferred to the next flush.
enum PendingWrite {
    InsertMax {
        at: DateTime<Utc>,
        arfcn: Arfcn,
        rssi: f64,
    },
    UpdateMax {
        at: DateTime<Utc>,
        arfcn: Arfcn,
        rssi: f64,
    },
    DeleteMax(Arfcn),
    ReplaceAvg {
        at: DateTime<Utc>,
        arfcn: Arfcn,
        mean: f64,
        count: usize,
    },
    DeleteAvg(Arfcn),
}

impl PendingWrite {
    fn apply(&self, store: &ObservationStore) -> Result<(), crate::store::StoreError> {
        match *self {
            Self::InsertMax { at, arfcn, rssi } => store.insert_max(at, arfcn, rssi),
            Self::UpdateMax { at, arfcn, rssi } => store.update_max(at, arfcn, rssi),
            Self::DeleteMax(arfcn) => store.delete_max(arfcn),
            Self::ReplaceAvg {
                at,
                arfcn,
                mean,
                count,
            } => store.replace_avg(at, arfcn, mean, count),
            Self::DeleteAvg(arfcn) => store.delete_avg(arfcn),
        }
    }
}

/// In-memory strength state. `max` and `recent` always hold the same key set.
struct StrengthTracker {
    last_arfcns: Vec<Arfcn>,
    ncc_permitted: Option<u8>,
    width: usize,
    max: HashMap<Arfcn, f64>,
    recent: HashMap<Arfcn, VecDeque<f64>>,
    pending: Vec<PendingWrite>,
}

impl StrengthTracker {
    fn new(width: usize) -> Self {
        Self {
            last_arfcns: Vec::new(),
            ncc_permitted: None,
            width,
            max: HashMap::new(),
            recent: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Fold one report's strength map into the running summaries.
    fn update(&mut self, strengths: &BTreeMap<Arfcn, crate::types::Rssi>) {
        let now = Utc::now();

        for (&arfcn, &raw) in strengths {
            let value = raw as f64;
            match self.max.get(&arfcn).copied() {
                None => {
                    self.max.insert(arfcn, value);
                    self.pending.push(PendingWrite::InsertMax {
                        at: now,
                        arfcn,
                        rssi: value,
                    });
                }
                Some(current) if value > current => {
                    self.max.insert(arfcn, value);
                    self.pending.push(PendingWrite::UpdateMax {
                        at: now,
                        arfcn,
                        rssi: value,
                    });
                }
                Some(_) => {}
            }

            let window = self.recent.entry(arfcn).or_default();
            if window.len() == self.width {
                window.pop_front();
            }
            window.push_back(value);
        }

        // Channels that fell out of the measurement set leave both summaries
        // together (their store rows too).
        let gone: Vec<Arfcn> = self
            .max
            .keys()
            .filter(|a| !strengths.contains_key(a))
            .copied()
            .collect();
        for arfcn in gone {
            self.max.remove(&arfcn);
            self.recent.remove(&arfcn);
            self.pending.push(PendingWrite::DeleteMax(arfcn));
            self.pending.push(PendingWrite::DeleteAvg(arfcn));
        }

        self.enqueue_avg_refresh(now);
    }

    /// Weighted per-channel average: `(max + sum(recent)) / (1 + |recent|)`.
    ///
    /// The `+1` in the denominator is the max term's weight; a channel whose
    /// every sample is the −1 sentinel converges to exactly −1.
    fn weighted(&self) -> BTreeMap<Arfcn, f64> {
        self.max
            .iter()
            .map(|(&arfcn, &max)| {
                // A half-written store can warm-load a max row without its
                // window; an empty window degrades to the max alone.
                let (sum, len) = self
                    .recent
                    .get(&arfcn)
                    .map(|w| (w.iter().sum::<f64>(), w.len()))
                    .unwrap_or((0.0, 0));
                (arfcn, (max + sum) / (1.0 + len as f64))
            })
            .collect()
    }

    fn enqueue_avg_refresh(&mut self, now: DateTime<Utc>) {
        let mut refresh = Vec::new();
        for (&arfcn, window) in &self.recent {
            if window.is_empty() {
                continue;
            }
            let mean = window.iter().sum::<f64>() / window.len() as f64;
            refresh.push(PendingWrite::ReplaceAvg {
                at: now,
                arfcn,
                mean,
                count: window.len(),
            });
        }
        self.pending.extend(refresh);
    }
}

struct DecoderShared {
    id: usize,
    current_arfcn: AtomicU16,
    ignore_reports: AtomicBool,
    msgs_seen: AtomicU64,
    tracker: Mutex<StrengthTracker>,
    reports: ReportLog,
}

/// Cloneable handle to a decoder worker's shared state.
#[derive(Clone)]
pub struct DecoderHandle {
    shared: Arc<DecoderShared>,
}

impl DecoderHandle {
    pub fn new(id: usize) -> Self {
        Self::with_limits(id, RECENT_WINDOW, REPORT_LIST_CAP)
    }

    pub fn with_limits(id: usize, window: usize, report_cap: usize) -> Self {
        Self {
            shared: Arc::new(DecoderShared {
                id,
                current_arfcn: AtomicU16::new(0),
                ignore_reports: AtomicBool::new(false),
                msgs_seen: AtomicU64::new(0),
                tracker: Mutex::new(StrengthTracker::new(window)),
                reports: ReportLog::new(report_cap),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Serving channel from the most recent TAP header, if one has been seen.
    pub fn current_arfcn(&self) -> Option<Arfcn> {
        Arfcn::new(self.shared.current_arfcn.load(Ordering::Relaxed))
    }

    pub fn ignore_reports(&self) -> bool {
        self.shared.ignore_reports.load(Ordering::Relaxed)
    }

    /// Controllers raise this across a neighbor-list change so reports taken
    /// against the outgoing list are not trusted.
    pub fn set_ignore_reports(&self, ignore: bool) {
        self.shared.ignore_reports.store(ignore, Ordering::Relaxed);
    }

    pub fn msgs_seen(&self) -> u64 {
        self.shared.msgs_seen.load(Ordering::Relaxed)
    }

    pub async fn last_neighbor_list(&self) -> Vec<Arfcn> {
        self.shared.tracker.lock().await.last_arfcns.clone()
    }

    pub async fn ncc_permitted(&self) -> Option<u8> {
        self.shared.tracker.lock().await.ncc_permitted
    }

    /// Weighted RSSI per known channel. Also refreshes the persisted
    /// recent-window summaries through the write-behind queue.
    pub async fn rssi(&self) -> BTreeMap<Arfcn, f64> {
        let mut tracker = self.shared.tracker.lock().await;
        let now = Utc::now();
        tracker.enqueue_avg_refresh(now);
        tracker.weighted()
    }

    /// Drain the accumulated measurement reports. Two successive calls with
    /// no intervening report return empty on the second.
    pub async fn reports(&self) -> Vec<MeasurementReport> {
        self.shared.reports.drain().await
    }
}

/// Drive one decoder over a dissector stream until the stream closes.
///
/// Seeds the in-memory summaries from the store, then processes records in
/// stream order, flushing the write-behind queue once per record.
pub async fn run<R: AsyncRead + Unpin>(
    handle: DecoderHandle,
    store: SharedStore,
    mut stream: RecordStream<R>,
) {
    let id = handle.id();

    {
        let mut tracker = handle.shared.tracker.lock().await;
        let width = tracker.width;
        match store.lock().await.warm_load(width) {
            Ok((max, recent)) => {
                info!(decoder = id, channels = max.len(), "warm-loaded strength history");
                tracker.max = max;
                tracker.recent = recent;
            }
            Err(e) => warn!(decoder = id, error = %e, "warm load failed, starting cold"),
        }
    }

    loop {
        let record = match stream.next_record().await {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) => {
                warn!(decoder = id, error = %e, "dissector stream read failed");
                break;
            }
        };

        flush_pending(&handle, &store).await;
        process(&handle, &record).await;
    }

    flush_pending(&handle, &store).await;
    info!(decoder = id, msgs = handle.msgs_seen(), "dissector stream closed");
}

async fn process(handle: &DecoderHandle, record: &str) {
    let id = handle.id();
    handle.shared.msgs_seen.fetch_add(1, Ordering::Relaxed);

    match RecordKind::classify(record) {
        Some(RecordKind::TapHeader) => match TapHeader::parse(record) {
            Ok(hdr) => {
                handle
                    .shared
                    .current_arfcn
                    .store(hdr.arfcn.get(), Ordering::Relaxed);
                debug!(decoder = id, arfcn = %hdr.arfcn, "serving channel");
            }
            Err(e) => debug!(decoder = id, error = %e, "unparseable TAP header"),
        },
        Some(RecordKind::SysInfo2) => match SysInfo2::parse(record) {
            Ok(si2) => {
                debug!(decoder = id, neighbors = ?si2.arfcns.iter().map(|a| a.get()).collect::<Vec<_>>(), "system information 2");
                let mut tracker = handle.shared.tracker.lock().await;
                tracker.last_arfcns = si2.arfcns;
                tracker.ncc_permitted = Some(si2.ncc_permitted);
            }
            Err(e) => debug!(decoder = id, error = %e, "unparseable SI2"),
        },
        Some(RecordKind::MeasurementReport) => {
            if handle.ignore_reports() {
                return;
            }
            let Some(serving) = handle.current_arfcn() else {
                return;
            };

            let mut tracker = handle.shared.tracker.lock().await;
            if tracker.last_arfcns.is_empty() {
                return;
            }

            match MeasurementReport::parse(&tracker.last_arfcns, serving, record) {
                Ok(report) => {
                    info!(decoder = id, strengths = ?report.strengths.iter().map(|(a, r)| (a.get(), *r)).collect::<Vec<_>>(), "measurement report");
                    tracker.update(&report.strengths);
                    drop(tracker);
                    handle.shared.reports.put(report).await;
                }
                Err(e) => debug!(decoder = id, error = %e, "discarding invalid report"),
            }
        }
        None => {}
    }
}

async fn flush_pending(handle: &DecoderHandle, store: &SharedStore) {
    let mut pending = {
        let mut tracker = handle.shared.tracker.lock().await;
        std::mem::take(&mut tracker.pending)
    };
    if pending.is_empty() {
        return;
    }

    let store = store.lock().await;
    let mut failed_at = None;
    for (i, write) in pending.iter().enumerate() {
        if let Err(e) = write.apply(&store) {
            warn!(decoder = handle.id(), error = %e, "store write failed, will retry");
            failed_at = Some(i);
            break;
        }
    }
    drop(store);

    if let Some(i) = failed_at {
        // Put the unapplied tail back so the next flush retries it.
        let mut tracker = handle.shared.tracker.lock().await;
        pending.drain(..i);
        pending.extend(tracker.pending.drain(..));
        tracker.pending = pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RSSI_UNREPORTED;

    fn arfcn(raw: u16) -> Arfcn {
        Arfcn::new(raw).unwrap()
    }

    fn report(pairs: &[(u16, crate::types::Rssi)]) -> MeasurementReport {
        MeasurementReport {
            timestamp: Utc::now(),
            serving: arfcn(pairs[0].0),
            strengths: pairs.iter().map(|&(a, r)| (arfcn(a), r)).collect(),
        }
    }

    #[tokio::test]
    async fn report_log_is_drain_once() {
        let log = ReportLog::new(10);
        log.put(report(&[(33, 16)])).await;
        log.put(report(&[(33, 20)])).await;

        assert_eq!(log.drain().await.len(), 2);
        assert!(log.drain().await.is_empty());
    }

    #[tokio::test]
    async fn report_log_drops_oldest_at_capacity() {
        let log = ReportLog::new(2);
        log.put(report(&[(1, 1)])).await;
        log.put(report(&[(2, 2)])).await;
        log.put(report(&[(3, 3)])).await;

        let drained = log.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].serving, arfcn(2));
        assert_eq!(drained[1].serving, arfcn(3));
    }

    #[test]
    fn tracker_window_is_bounded() {
        let mut tracker = StrengthTracker::new(100);
        let strengths: BTreeMap<Arfcn, crate::types::Rssi> = [(arfcn(45), 10)].into();
        for _ in 0..101 {
            tracker.update(&strengths);
        }
        assert_eq!(tracker.recent[&arfcn(45)].len(), 100);
        assert_eq!(tracker.max[&arfcn(45)], 10.0);
        let weighted = tracker.weighted();
        assert!((weighted[&arfcn(45)] - (10.0 + 1000.0) / 101.0).abs() < 1e-9);
    }

    #[test]
    fn unheard_channel_converges_to_sentinel() {
        let mut tracker = StrengthTracker::new(100);
        let strengths: BTreeMap<Arfcn, crate::types::Rssi> =
            [(arfcn(7), RSSI_UNREPORTED)].into();
        for _ in 0..150 {
            tracker.update(&strengths);
        }
        assert_eq!(tracker.weighted()[&arfcn(7)], -1.0);
    }

    #[test]
    fn max_and_recent_key_sets_stay_equal() {
        let mut tracker = StrengthTracker::new(100);
        tracker.update(&[(arfcn(10), 5), (arfcn(11), 6)].into());
        tracker.update(&[(arfcn(11), 7)].into());

        assert!(!tracker.max.contains_key(&arfcn(10)));
        assert!(!tracker.recent.contains_key(&arfcn(10)));
        assert_eq!(
            tracker.max.keys().collect::<std::collections::BTreeSet<_>>(),
            tracker.recent.keys().collect::<std::collections::BTreeSet<_>>()
        );
    }
}
