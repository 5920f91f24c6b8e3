//! Single-BTS spectrum-sensing cycle.
//!
//! Every tick the controller folds the decoder's weighted RSSI snapshot into
//! the observation store. On the slower neighbor cycle it retunes C0 onto a
//! random safe channel (if any is known), points the neighbor list at five
//! channels it has never scanned, and raises `ignore_reports` so handsets
//! measuring against the outgoing list cannot poison the new window.

use crate::bts::Bts;
use crate::decoder::{DecoderHandle, SharedStore};
use crate::types::{Arfcn, ARFCN_MIN, IGNORE_REPORTS_MAX_SECS, NEIGHBORS_PER_CYCLE};
use chrono::Utc;
use rand::seq::{IteratorRandom, SliceRandom};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Upper bound (exclusive) of the neighbor-sampling range. The top channel
/// of the band never enters rotation.
const NEIGHBOR_SAMPLE_END: u16 = 124;

pub struct Controller<B: Bts> {
    bts: B,
    decoder: DecoderHandle,
    store: SharedStore,
    neighbor_cycle: Duration,
    sleep: Duration,
    last_cycle: Instant,
    ignored_since: Instant,
}

impl<B: Bts> Controller<B> {
    pub fn new(
        bts: B,
        decoder: DecoderHandle,
        store: SharedStore,
        neighbor_cycle: Duration,
        sleep: Duration,
    ) -> Self {
        Self {
            bts,
            decoder,
            store,
            neighbor_cycle,
            sleep,
            last_cycle: Instant::now(),
            ignored_since: Instant::now(),
        }
    }

    /// A random channel verified safe, or `None` when nothing qualifies yet.
    /// Deliberately does not exclude the unit's own current channel.
    async fn pick_new_safe_arfcn(&self) -> Option<Arfcn> {
        let safe = match self.store.lock().await.safe_arfcns() {
            Ok(safe) => safe,
            Err(e) => {
                warn!(error = %e, "safe-channel query failed");
                return None;
            }
        };
        safe.choose(&mut rand::thread_rng()).copied()
    }

    /// Channels we have never scanned, sampled uniformly from the band.
    async fn pick_new_neighbors(&self) -> Vec<Arfcn> {
        let tracked = match self.store.lock().await.tracked_arfcns() {
            Ok(tracked) => tracked,
            Err(e) => {
                warn!(error = %e, "tracked-channel query failed");
                Vec::new()
            }
        };
        (ARFCN_MIN..NEIGHBOR_SAMPLE_END)
            .filter_map(Arfcn::new)
            .filter(|a| !tracked.contains(a))
            .choose_multiple(&mut rand::thread_rng(), NEIGHBORS_PER_CYCLE)
    }

    /// Rotate onto a safe channel and a fresh probe set.
    async fn rotate(&mut self) {
        match self.pick_new_safe_arfcn().await {
            Some(arfcn) => {
                if let Err(e) = self.bts.change_arfcn(arfcn.get(), false).await {
                    warn!(error = %e, "retune rejected, continuing on current channel");
                }
            }
            None => error!("unable to pick new safe ARFCN"),
        }

        let neighbors = self.pick_new_neighbors().await;
        if let Err(e) = self.bts.set_neighbors(&neighbors, &[]).await {
            warn!(error = %e, "neighbor assignment failed, retrying next cycle");
        }

        self.decoder.set_ignore_reports(true);
        self.ignored_since = Instant::now();
        self.last_cycle = Instant::now();
    }

    /// One controller tick.
    pub async fn tick(&mut self) {
        if self.decoder.ignore_reports()
            && self.ignored_since.elapsed() > Duration::from_secs(IGNORE_REPORTS_MAX_SECS)
        {
            self.decoder.set_ignore_reports(false);
        }

        if self.last_cycle.elapsed() > self.neighbor_cycle {
            self.rotate().await;
        }

        match self.decoder.current_arfcn() {
            Some(arfcn) => info!(%arfcn, "current ARFCN"),
            None => info!("current ARFCN not yet known"),
        }

        let rssis = self.decoder.rssi().await;
        {
            let store = self.store.lock().await;
            info!(channels = rssis.len(), "updating availability");
            if let Err(e) =
                store.upsert_availability(&rssis, Utc::now(), self.neighbor_cycle.as_secs())
            {
                warn!(error = %e, "availability update failed, retrying next tick");
            }
            match store.safe_arfcns() {
                Ok(safe) => {
                    info!(safe = ?safe.iter().map(|a| a.get()).collect::<Vec<_>>(), "safe ARFCNs")
                }
                Err(e) => warn!(error = %e, "safe-channel query failed"),
            }
        }
    }

    /// Tick forever. The caller races this against its shutdown signal.
    pub async fn run(&mut self) {
        loop {
            self.tick().await;
            tokio::time::sleep(self.sleep).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bts::BtsError;
    use crate::store::ObservationStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn arfcn(raw: u16) -> Arfcn {
        Arfcn::new(raw).unwrap()
    }

    #[derive(Default)]
    struct MockBts {
        changes: Vec<(u16, bool)>,
        neighbor_sets: Vec<Vec<u16>>,
    }

    impl Bts for MockBts {
        fn id(&self) -> usize {
            0
        }
        fn current_arfcn(&self) -> Result<Arfcn, BtsError> {
            Ok(arfcn(51))
        }
        async fn change_arfcn(&mut self, new_arfcn: u16, immediate: bool) -> Result<(), BtsError> {
            self.changes.push((new_arfcn, immediate));
            Ok(())
        }
        async fn set_txatten(&mut self, _atten_db: u32) -> Result<(), BtsError> {
            Ok(())
        }
        async fn set_neighbors(
            &mut self,
            arfcns: &[Arfcn],
            _real_ips: &[String],
        ) -> Result<(), BtsError> {
            self.neighbor_sets
                .push(arfcns.iter().map(|a| a.get()).collect());
            Ok(())
        }
        async fn restart(&mut self) -> Result<(), BtsError> {
            Ok(())
        }
        fn is_off(&self) -> bool {
            false
        }
        fn offset_correct(&self) -> Result<bool, BtsError> {
            Ok(true)
        }
    }

    fn controller(store: SharedStore) -> Controller<MockBts> {
        Controller::new(
            MockBts::default(),
            DecoderHandle::new(0),
            store,
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
    }

    fn shared_store() -> SharedStore {
        Arc::new(Mutex::new(ObservationStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn rotation_retunes_onto_safe_channel() {
        let store = shared_store();
        {
            let s = store.lock().await;
            let rssis: BTreeMap<Arfcn, f64> = [(arfcn(42), -0.8)].into();
            s.upsert_availability(&rssis, Utc::now(), 60).unwrap();
        }

        let mut ctl = controller(store);
        ctl.last_cycle = Instant::now() - Duration::from_secs(61);
        ctl.tick().await;

        assert_eq!(ctl.bts.changes, vec![(42, false)]);
        assert!(ctl.decoder.ignore_reports());
        assert_eq!(ctl.bts.neighbor_sets.len(), 1);
    }

    #[tokio::test]
    async fn empty_safe_set_skips_retune_but_rotates_neighbors() {
        let store = shared_store();
        let mut ctl = controller(store);
        ctl.last_cycle = Instant::now() - Duration::from_secs(61);
        ctl.tick().await;

        assert!(ctl.bts.changes.is_empty());
        assert_eq!(ctl.bts.neighbor_sets.len(), 1);
    }

    #[tokio::test]
    async fn neighbors_sampled_outside_tracked_set() {
        let store = shared_store();
        {
            let s = store.lock().await;
            // Track everything but five channels.
            let rssis: BTreeMap<Arfcn, f64> = (1u16..124)
                .filter(|raw| ![7, 23, 64, 88, 110].contains(raw))
                .filter_map(Arfcn::new)
                .map(|a| (a, 5.0))
                .collect();
            s.upsert_availability(&rssis, Utc::now(), 60).unwrap();
        }

        let ctl = controller(store);
        let mut picked: Vec<u16> = ctl
            .pick_new_neighbors()
            .await
            .iter()
            .map(|a| a.get())
            .collect();
        picked.sort_unstable();
        assert_eq!(picked, vec![7, 23, 64, 88, 110]);
    }

    #[tokio::test]
    async fn stale_ignore_flag_is_cleared() {
        let store = shared_store();
        let mut ctl = controller(store);
        ctl.decoder.set_ignore_reports(true);
        ctl.ignored_since = Instant::now() - Duration::from_secs(IGNORE_REPORTS_MAX_SECS + 1);
        ctl.tick().await;
        assert!(!ctl.decoder.ignore_reports());
    }
}
