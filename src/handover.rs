//! Dual-BTS handover controller.
//!
//! Two co-located units take turns attenuating on a fixed schedule: one
//! serves at full power while the other steps down to an "off" level, so its
//! channel can be measured for co-channel activity through the serving
//! unit's handsets. Each unit's neighbor list includes the other unit's
//! serving channel, which is what makes the cross-observation work.
//!
//! When a drained measurement report shows energy on the channel of a unit
//! that is currently off, somebody else is transmitting there: that unit is
//! bounced onto a new channel immediately.

use crate::bts::Bts;
use crate::decoder::{DecoderHandle, SharedStore};
use crate::gsm::MeasurementReport;
use crate::types::{
    Arfcn, ARFCN_MIN, ATTEN_CYCLE_SECS, ATTEN_LADDER_DB, ATTEN_SLOT_SECS,
    IGNORE_REPORTS_MAX_SECS, INTERFERENCE_RSSI, NEIGHBORS_PER_CYCLE,
};
use chrono::Utc;
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Channel step applied when interference forces a retune: far enough to
/// clear the occupant's bandwidth, close enough to stay on the same visible
/// spectrum.
const INTERFERENCE_STEP: u16 = 10;

/// Attenuation-schedule state for a unit at `elapsed_secs` since its own
/// schedule start.
///
/// Time is floored to the slot size; the phase ramps the unit through states
/// 0→3 in the back half of each cycle. With two units staggered by one
/// cycle length, at most one unit is ever in state 3, and each spends most
/// of its time in state 0. Negative elapsed (a stagger start still in the
/// future) is well-defined through the Euclidean remainder.
pub fn schedule_state(elapsed_secs: i64, cycle_secs: u64) -> usize {
    let slot = ATTEN_SLOT_SECS as i64;
    let cycle = cycle_secs as i64;
    let t = elapsed_secs.div_euclid(slot) * slot;
    let phase = t.rem_euclid(2 * cycle) - (cycle - slot);
    phase.div_euclid(slot).clamp(0, 3) as usize
}

/// One unit of the pair: driver, decoder handle, and schedule bookkeeping.
pub struct BtsUnit<B> {
    bts: B,
    decoder: DecoderHandle,
    /// This unit's own peering address, handed to the other unit as its one
    /// real neighbor.
    peer_addr: String,
    /// Schedule start relative to the controller epoch.
    start_offset_secs: i64,
    atten_state: usize,
    intended_neighbors: Vec<Arfcn>,
    last_switch: Instant,
    last_cycle: Instant,
    ignored_since: Instant,
}

impl<B: Bts> BtsUnit<B> {
    pub fn new(bts: B, decoder: DecoderHandle, peer_addr: String) -> Self {
        Self {
            bts,
            decoder,
            peer_addr,
            start_offset_secs: 0,
            atten_state: 0,
            intended_neighbors: Vec::new(),
            last_switch: Instant::now(),
            last_cycle: Instant::now(),
            ignored_since: Instant::now(),
        }
    }

    pub fn decoder(&self) -> &DecoderHandle {
        &self.decoder
    }

    pub fn bts(&self) -> &B {
        &self.bts
    }

    /// The neighbor set this unit was last pointed at (what the stack should
    /// be carrying, as opposed to what the decoder last heard announced).
    pub fn intended_neighbors(&self) -> &[Arfcn] {
        &self.intended_neighbors
    }
}

pub struct HandoverController<B> {
    units: [BtsUnit<B>; 2],
    store: SharedStore,
    epoch: Instant,
    atten_cycle: Duration,
    neighbor_cycle: Duration,
    sleep: Duration,
}

impl<B: Bts> HandoverController<B> {
    /// Pair two units. The second unit's schedule is staggered by one
    /// attenuation cycle so the off-phases interleave.
    pub fn new(
        unit0: BtsUnit<B>,
        unit1: BtsUnit<B>,
        store: SharedStore,
        neighbor_cycle: Duration,
        sleep: Duration,
    ) -> Self {
        let mut units = [unit0, unit1];
        units[0].start_offset_secs = 0;
        units[1].start_offset_secs = ATTEN_CYCLE_SECS as i64;
        Self {
            units,
            store,
            epoch: Instant::now(),
            atten_cycle: Duration::from_secs(ATTEN_CYCLE_SECS),
            neighbor_cycle,
            sleep,
        }
    }

    /// Advance one unit's attenuation to where the schedule says it should
    /// be.
    async fn next_atten_state(&mut self, idx: usize) {
        let now_secs = self.epoch.elapsed().as_secs() as i64;
        let unit = &mut self.units[idx];
        let desired = schedule_state(
            now_secs - unit.start_offset_secs,
            self.atten_cycle.as_secs(),
        );
        if desired == unit.atten_state {
            return;
        }

        debug!(
            bts = unit.bts.id(),
            from = unit.atten_state,
            to = desired,
            held_secs = unit.last_switch.elapsed().as_secs(),
            "attenuation state change"
        );
        match unit.bts.set_txatten(ATTEN_LADDER_DB[desired]).await {
            Ok(()) => {
                unit.atten_state = desired;
                unit.last_switch = Instant::now();
            }
            Err(e) => warn!(bts = unit.bts.id(), error = %e, "txatten failed, will retry"),
        }
    }

    /// Rotate one unit's neighbor list: the other unit's serving channel
    /// first (its real peer), then channels never scanned before.
    async fn rotate_neighbors(&mut self, idx: usize) {
        let other = &self.units[1 - idx];
        let other_arfcn = match other.bts.current_arfcn() {
            Ok(arfcn) => arfcn,
            Err(e) => {
                warn!(bts = other.bts.id(), error = %e, "peer channel unknown, skipping rotation");
                return;
            }
        };
        let other_addr = other.peer_addr.clone();

        let tracked = match self.store.lock().await.tracked_arfcns() {
            Ok(tracked) => tracked,
            Err(e) => {
                warn!(error = %e, "tracked-channel query failed");
                Vec::new()
            }
        };
        let mut neighbors = vec![other_arfcn];
        neighbors.extend(
            (ARFCN_MIN..crate::types::ARFCN_MAX)
                .filter_map(Arfcn::new)
                .filter(|a| *a != other_arfcn && !tracked.contains(a))
                .choose_multiple(&mut rand::thread_rng(), NEIGHBORS_PER_CYCLE),
        );

        let unit = &mut self.units[idx];
        if let Err(e) = unit
            .bts
            .set_neighbors(&neighbors, std::slice::from_ref(&other_addr))
            .await
        {
            warn!(bts = unit.bts.id(), error = %e, "neighbor assignment failed, retrying next cycle");
            return;
        }

        unit.intended_neighbors = neighbors;
        unit.decoder.set_ignore_reports(true);
        unit.ignored_since = Instant::now();
        unit.last_cycle = Instant::now();
    }

    /// Units whose channel was heard above the interference threshold while
    /// they were off.
    fn interference_victims(&self, reports: &[MeasurementReport]) -> Vec<usize> {
        let arfcn_to_unit: HashMap<Arfcn, usize> = self
            .units
            .iter()
            .enumerate()
            .filter_map(|(i, u)| u.bts.current_arfcn().ok().map(|a| (a, i)))
            .collect();

        let mut victims = Vec::new();
        for report in reports {
            for (&arfcn, &rssi) in &report.strengths {
                let Some(&idx) = arfcn_to_unit.get(&arfcn) else {
                    continue;
                };
                if rssi > INTERFERENCE_RSSI && self.units[idx].bts.is_off() && !victims.contains(&idx)
                {
                    info!(
                        bts = self.units[idx].bts.id(),
                        %arfcn,
                        rssi,
                        "co-channel interference while off"
                    );
                    victims.push(idx);
                }
            }
        }
        victims
    }

    /// One tick over both units: attenuation schedule, neighbor upkeep,
    /// availability update, then the interference scan over every report
    /// drained since the last tick.
    pub async fn tick(&mut self) {
        for idx in 0..self.units.len() {
            self.next_atten_state(idx).await;

            let unit = &mut self.units[idx];
            if unit.decoder.ignore_reports()
                && unit.ignored_since.elapsed() > Duration::from_secs(IGNORE_REPORTS_MAX_SECS)
            {
                unit.decoder.set_ignore_reports(false);
            }

            if unit.last_cycle.elapsed() > self.neighbor_cycle {
                self.rotate_neighbors(idx).await;
            }

            let unit = &mut self.units[idx];
            if let Err(e) = unit.bts.reassert_neighbors().await {
                warn!(bts = unit.bts.id(), error = %e, "neighbor reassertion failed, retrying next tick");
            }

            let rssis = unit.decoder.rssi().await;
            if !rssis.is_empty() {
                let store = self.store.lock().await;
                if let Err(e) =
                    store.upsert_availability(&rssis, Utc::now(), self.neighbor_cycle.as_secs())
                {
                    warn!(error = %e, "availability update failed, retrying next tick");
                }
            }
        }

        let mut reports = Vec::new();
        for unit in &self.units {
            reports.extend(unit.decoder.reports().await);
        }

        for idx in self.interference_victims(&reports) {
            let unit = &mut self.units[idx];
            let current = match unit.bts.current_arfcn() {
                Ok(arfcn) => arfcn,
                Err(e) => {
                    warn!(bts = unit.bts.id(), error = %e, "cannot read channel for retune");
                    continue;
                }
            };
            let next = current.stepped(INTERFERENCE_STEP);
            warn!(bts = unit.bts.id(), from = %current, to = %next, "channel occupied, retuning now");
            if let Err(e) = unit.bts.change_arfcn(next.get(), true).await {
                warn!(bts = unit.bts.id(), error = %e, "emergency retune failed");
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
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn arfcn(raw: u16) -> Arfcn {
        Arfcn::new(raw).unwrap()
    }

    struct MockBts {
        id: usize,
        arfcn: u16,
        off: bool,
        changes: Vec<(u16, bool)>,
        attens: Vec<u32>,
        reasserts: usize,
    }

    impl MockBts {
        fn new(id: usize, arfcn: u16, off: bool) -> Self {
            Self {
                id,
                arfcn,
                off,
                changes: Vec::new(),
                attens: Vec::new(),
                reasserts: 0,
            }
        }
    }

    impl Bts for MockBts {
        fn id(&self) -> usize {
            self.id
        }
        fn current_arfcn(&self) -> Result<Arfcn, BtsError> {
            Ok(arfcn(self.arfcn))
        }
        async fn change_arfcn(&mut self, new_arfcn: u16, immediate: bool) -> Result<(), BtsError> {
            self.changes.push((new_arfcn, immediate));
            self.arfcn = new_arfcn;
            Ok(())
        }
        async fn set_txatten(&mut self, atten_db: u32) -> Result<(), BtsError> {
            self.attens.push(atten_db);
            Ok(())
        }
        async fn set_neighbors(
            &mut self,
            _arfcns: &[Arfcn],
            _real_ips: &[String],
        ) -> Result<(), BtsError> {
            Ok(())
        }
        async fn restart(&mut self) -> Result<(), BtsError> {
            Ok(())
        }
        async fn reassert_neighbors(&mut self) -> Result<(), BtsError> {
            self.reasserts += 1;
            Ok(())
        }
        fn is_off(&self) -> bool {
            self.off
        }
        fn offset_correct(&self) -> Result<bool, BtsError> {
            Ok(true)
        }
    }

    fn controller(unit0: MockBts, unit1: MockBts) -> HandoverController<MockBts> {
        HandoverController::new(
            BtsUnit::new(unit0, DecoderHandle::new(0), "127.0.0.1:16001".into()),
            BtsUnit::new(unit1, DecoderHandle::new(1), "127.0.0.1:16011".into()),
            Arc::new(Mutex::new(ObservationStore::open_in_memory().unwrap())),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        )
    }

    fn report(strengths: &[(u16, i32)]) -> MeasurementReport {
        MeasurementReport {
            timestamp: Utc::now(),
            serving: arfcn(strengths[0].0),
            strengths: strengths.iter().map(|&(a, r)| (arfcn(a), r)).collect(),
        }
    }

    #[test]
    fn at_most_one_unit_off_across_schedule() {
        let offsets = [0i64, ATTEN_CYCLE_SECS as i64];
        for now in 0..3600 {
            let off_count = offsets
                .iter()
                .filter(|&&o| schedule_state(now - o, ATTEN_CYCLE_SECS) == 3)
                .count();
            assert!(off_count <= 1, "both units off at t={now}");
        }
    }

    #[test]
    fn staggered_units_swap_roles() {
        let o0 = 0i64;
        let o1 = ATTEN_CYCLE_SECS as i64;
        let s0 = |t: i64| schedule_state(t - o0, ATTEN_CYCLE_SECS);
        let s1 = |t: i64| schedule_state(t - o1, ATTEN_CYCLE_SECS);

        // One unit off, the other serving; 90 s later the roles are reversed.
        assert_eq!((s0(85), s1(85)), (0, 3));
        assert_eq!((s0(175), s1(175)), (3, 0));
    }

    #[test]
    fn schedule_spends_most_time_serving() {
        let period = 2 * ATTEN_CYCLE_SECS as i64;
        let serving = (0..period)
            .filter(|&t| schedule_state(t, ATTEN_CYCLE_SECS) == 0)
            .count() as i64;
        assert!(serving * 2 >= period);
    }

    #[tokio::test]
    async fn off_unit_heard_loudly_is_retuned() {
        let mut ctl = controller(MockBts::new(0, 30, true), MockBts::new(1, 77, false));

        let victims = ctl.interference_victims(&[report(&[(30, 25), (45, -1)])]);
        assert_eq!(victims, vec![0]);

        // Through a full tick: unit 0 is bounced ten channels up, immediately.
        push_report(&ctl.units[1].decoder, report(&[(30, 25), (45, -1)])).await;
        ctl.tick().await;
        assert_eq!(ctl.units[0].bts.changes, vec![(40, true)]);
        assert!(ctl.units[1].bts.changes.is_empty());
    }

    #[tokio::test]
    async fn serving_unit_is_not_retuned() {
        let ctl = controller(MockBts::new(0, 30, false), MockBts::new(1, 77, false));
        assert!(ctl
            .interference_victims(&[report(&[(30, 25)])])
            .is_empty());
    }

    #[tokio::test]
    async fn quiet_channel_triggers_nothing() {
        let ctl = controller(MockBts::new(0, 30, true), MockBts::new(1, 77, false));
        assert!(ctl
            .interference_victims(&[report(&[(30, 5)])])
            .is_empty());
    }

    #[tokio::test]
    async fn tick_reasserts_neighbor_state() {
        let mut ctl = controller(MockBts::new(0, 30, false), MockBts::new(1, 77, false));
        ctl.tick().await;
        assert_eq!(ctl.units[0].bts.reasserts, 1);
        assert_eq!(ctl.units[1].bts.reasserts, 1);
        // The staggered unit starts one slot into its ramp.
        assert_eq!(ctl.units[1].bts.attens, vec![ATTEN_LADDER_DB[1]]);
    }

    /// Feed a report through the decoder's public pipeline by synthesizing
    /// the dissector records it would have come from.
    async fn push_report(handle: &DecoderHandle, report: MeasurementReport) {
        // The drain-once log is private to the decoder; go through the
        // stream instead.
        let neighbors: Vec<Arfcn> = report.strengths.keys().copied().collect();
        let serving = report.serving;
        let serving_rssi = report.strengths[&serving].max(0);

        let mut text = format!("GSM TAP Header, ARFCN: {serving}\n");
        text.push_str("GSM CCCH - System Information Type 2\n");
        text.push_str(&format!(
            "    List of ARFCNs = {}\n",
            neighbors
                .iter()
                .map(|a| a.get().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        ));
        text.push_str("    1111 1111 = NCC Permitted: 0xff\n");
        text.push_str("GSM A-I/F DTAP - Measurement Report\n");
        text.push_str(&format!(
            "    ..01 0000 = RXLEV-FULL-SERVING-CELL: -95 <= x < -94 dBm ({serving_rssi})\n"
        ));
        let pairs: Vec<(usize, i32)> = neighbors
            .iter()
            .enumerate()
            .filter(|(_, a)| **a != serving)
            .filter(|(_, a)| report.strengths[*a] >= 0)
            .map(|(i, a)| (i, report.strengths[a]))
            .collect();
        text.push_str(&format!(
            "    .... ...0  01.. .... = NO-NCELL-M: {} neighbour cell measurement result ({})\n",
            pairs.len(),
            pairs.len()
        ));
        for (idx, rssi) in pairs {
            text.push_str(&format!("    ..01 0001 = RXLEV-NCELL: {rssi}\n"));
            text.push_str(&format!("    0001 0... = BCCH-FREQ-NCELL: {idx}\n"));
        }
        text.push_str("end of capture\n");

        let store = Arc::new(Mutex::new(ObservationStore::open_in_memory().unwrap()));
        crate::decoder::run(
            handle.clone(),
            store,
            crate::stream::RecordStream::new(text.as_bytes()),
        )
        .await;
    }
}
