//! Recognizers for the three dissector record kinds we care about.
//!
//! The packet dissector runs in verbose mode and pretty-prints every decoded
//! GSMTAP frame. Rather than decoding the air interface ourselves we scrape
//! that text: the serving cell identity from the TAP header, the advertised
//! neighbor list from System Information Type 2, and per-channel signal
//! strengths from handset Measurement Reports.
//!
//! Each recognizer is regex-driven. The dissector's output format is stable,
//! but the patterns still tolerate trailing-whitespace variation and every
//! recognizer is unit-tested against a captured sample.

use crate::types::{Arfcn, Rssi, RSSI_UNREPORTED};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

/// First line of a GSMTAP pseudo-header record.
pub const TAP_HEADER_PREFIX: &str = "GSM TAP Header";

/// First line of a System Information Type 2 record.
pub const SYS_INFO_2_PREFIX: &str = "GSM CCCH - System Information Type 2";

/// First line of a handset measurement report record.
pub const MEASUREMENT_REPORT_PREFIX: &str = "GSM A-I/F DTAP - Measurement Report";

static TAP_ARFCN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"GSM TAP Header, ARFCN: (\d+)").unwrap());
static SERVING_STRENGTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RXLEV-FULL-SERVING-CELL:.*dBm \((\d+)\)").unwrap());
static NUM_CELLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"NO-NCELL-M:.*result \((\d+)\)").unwrap());
static NEIGHBOR_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RXLEV-NCELL: (\d+)[ \t]*\n.*= BCCH-FREQ-NCELL: (\d+)").unwrap());
static SYS_INFO_2: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)List of ARFCNs =([ \d]+).*(\d{4} \d{4}) = NCC Permitted").unwrap());

/// Per-message parse failure. Reports that fail to parse are discarded; the
/// stream continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GsmError {
    #[error("required field missing: {0}")]
    MissingField(&'static str),
    #[error("neighbor pair count {found} disagrees with NO-NCELL-M {expected}")]
    CellCountMismatch { expected: usize, found: usize },
    #[error("BCCH frequency index {0} outside the current neighbor list")]
    BadNeighborIndex(usize),
    #[error("ARFCN {0} outside the GSM 900 band")]
    BadArfcn(u32),
}

fn capture_u32(re: &Regex, msg: &str, field: &'static str) -> Result<u32, GsmError> {
    let caps = re.captures(msg).ok_or(GsmError::MissingField(field))?;
    caps[1].parse().map_err(|_| GsmError::MissingField(field))
}

fn checked_arfcn(raw: u32) -> Result<Arfcn, GsmError> {
    u16::try_from(raw)
        .ok()
        .and_then(Arfcn::new)
        .ok_or(GsmError::BadArfcn(raw))
}

/// Record kinds recognized out of the dissector stream. Everything else is
/// skipped without comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    TapHeader,
    SysInfo2,
    MeasurementReport,
}

impl RecordKind {
    /// Classify a raw record by its first line.
    pub fn classify(record: &str) -> Option<Self> {
        if record.starts_with(MEASUREMENT_REPORT_PREFIX) {
            Some(Self::MeasurementReport)
        } else if record.starts_with(SYS_INFO_2_PREFIX) {
            Some(Self::SysInfo2)
        } else if record.starts_with(TAP_HEADER_PREFIX) {
            Some(Self::TapHeader)
        } else {
            None
        }
    }
}

/// Serving-cell identity scraped from a GSMTAP pseudo-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapHeader {
    pub arfcn: Arfcn,
}

impl TapHeader {
    pub fn parse(msg: &str) -> Result<Self, GsmError> {
        let raw = capture_u32(&TAP_ARFCN, msg, "ARFCN")?;
        Ok(Self {
            arfcn: checked_arfcn(raw)?,
        })
    }
}

/// Neighbor list and NCC-permitted mask from System Information Type 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysInfo2 {
    pub arfcns: Vec<Arfcn>,
    /// 8-bit NCC-permitted bitmap, rendered by the dissector as two 4-bit
    /// groups.
    pub ncc_permitted: u8,
}

impl SysInfo2 {
    pub fn parse(msg: &str) -> Result<Self, GsmError> {
        let caps = SYS_INFO_2
            .captures(msg)
            .ok_or(GsmError::MissingField("List of ARFCNs"))?;

        let mut arfcns = Vec::new();
        for tok in caps[1].split_whitespace() {
            let raw: u32 = tok
                .parse()
                .map_err(|_| GsmError::MissingField("List of ARFCNs"))?;
            arfcns.push(checked_arfcn(raw)?);
        }

        let bits: String = caps[2].split_whitespace().collect();
        let ncc_permitted = u8::from_str_radix(&bits, 2)
            .map_err(|_| GsmError::MissingField("NCC Permitted"))?;

        Ok(Self {
            arfcns,
            ncc_permitted,
        })
    }
}

/// One handset measurement report, resolved against the neighbor list that
/// was in force when the handset measured.
///
/// Every announced neighbor gets an entry: channels the handset did not
/// report come back as [`RSSI_UNREPORTED`]. Silence is evidence of vacancy,
/// and the running average in the decoder depends on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementReport {
    pub timestamp: DateTime<Utc>,
    pub serving: Arfcn,
    pub strengths: BTreeMap<Arfcn, Rssi>,
}

impl MeasurementReport {
    /// Parse a report against the current neighbor list and serving channel.
    ///
    /// The report's BCCH-FREQ-NCELL values are indices into `neighbors`, not
    /// channel numbers. A count that disagrees with NO-NCELL-M or an index
    /// outside the list invalidates the whole report.
    pub fn parse(neighbors: &[Arfcn], serving: Arfcn, msg: &str) -> Result<Self, GsmError> {
        let mut strengths: BTreeMap<Arfcn, Rssi> =
            neighbors.iter().map(|&a| (a, RSSI_UNREPORTED)).collect();

        let serving_strength = capture_u32(&SERVING_STRENGTH, msg, "RXLEV-FULL-SERVING-CELL")?;
        strengths.insert(serving, serving_strength as Rssi);

        let num_cells = capture_u32(&NUM_CELLS, msg, "NO-NCELL-M")? as usize;

        let pairs: Vec<(u32, usize)> = NEIGHBOR_PAIR
            .captures_iter(msg)
            .map(|caps| {
                let rxlev: u32 = caps[1].parse().unwrap_or(0);
                let idx: usize = caps[2].parse().unwrap_or(usize::MAX);
                (rxlev, idx)
            })
            .collect();

        if pairs.len() != num_cells {
            return Err(GsmError::CellCountMismatch {
                expected: num_cells,
                found: pairs.len(),
            });
        }

        for (rxlev, idx) in pairs {
            let arfcn = *neighbors.get(idx).ok_or(GsmError::BadNeighborIndex(idx))?;
            strengths.insert(arfcn, rxlev as Rssi);
        }

        Ok(Self {
            timestamp: Utc::now(),
            serving,
            strengths,
        })
    }
}
