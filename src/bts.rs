//! Driver for one physical BTS.
//!
//! The stack is steered through three surfaces: a sqlite configuration store
//! (read here, written through the CLI), the textual command socket, and the
//! NeighborTable database the handover machinery keeps per unit.
//!
//! The interesting part is neighbor assignment. The stack only accepts
//! neighbor *IP addresses* and builds its NeighborTable by peering with each
//! one. To scan arbitrary channels without real peers, the driver registers
//! unroutable loopback addresses and then writes the table rows itself, one
//! fabricated row per channel to probe. Rows the stack cannot re-peer with
//! get dropped, so controllers must re-assert them every tick.

use crate::cli::{CliError, CmdSocket};
use crate::types::{Arfcn, ATTEN_LADDER_DB, OFF_HOLD_SECS};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Fabricated-neighbor subnet for a single-unit deployment.
pub const FAKE_SUBNET_SINGLE: &str = "127.0.10.";

/// Fabricated-neighbor subnet when two co-located units each carry their own
/// peering port.
pub const FAKE_SUBNET_DUAL: &str = "127.0.9.";

/// Default peering port for NeighborTable row addresses.
pub const DEFAULT_PEER_PORT: u16 = 16001;

/// Holdoff written into fabricated rows: long enough that the stack never
/// retries handover toward a fake peer.
const FABRICATED_HOLDOFF_SECS: i64 = 1 << 20;

/// Fabricated rows are backdated this much so they look freshly peered.
const FABRICATED_BACKDATE_SECS: i64 = 10;

const FABRICATED_BSIC: i64 = 1;

/// Seconds to wait after killing the BTS before trusting the runloop to
/// bring it back.
const RESTART_SETTLE_SECS: u64 = 2;

#[derive(Debug, Error)]
pub enum BtsError {
    #[error("ARFCN {0} outside 1..=124")]
    InvalidArfcn(u16),
    #[error("config key {0} missing")]
    MissingConfig(String),
    #[error("NeighborTable column {0} unrecognized")]
    UnknownColumn(String),
    #[error(transparent)]
    Cli(#[from] CliError),
    #[error("config store: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("process control: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability set every controller depends on. Two implementations:
/// [`OpenBts`] (NeighborTable-driven stacks) and [`LegacyBts`] (config-list
/// stacks).
#[allow(async_fn_in_trait)]
pub trait Bts {
    fn id(&self) -> usize;

    /// The channel the unit will broadcast on, from `GSM.Radio.C0`.
    fn current_arfcn(&self) -> Result<Arfcn, BtsError>;

    /// Write `GSM.Radio.C0`. Values outside the band are rejected with no
    /// side effect. With `immediate`, the unit is restarted so the change
    /// takes effect now rather than at the next restart.
    async fn change_arfcn(&mut self, new_arfcn: u16, immediate: bool) -> Result<(), BtsError>;

    /// Transmit attenuation in dB, effective immediately.
    async fn set_txatten(&mut self, atten_db: u32) -> Result<(), BtsError>;

    /// Point the unit's neighbor machinery at `arfcns`. Entries covered by
    /// `real_ips` (prefix of the list) are genuine peers; the rest are
    /// fabricated so they can be scanned without a transmitter behind them.
    async fn set_neighbors(&mut self, arfcns: &[Arfcn], real_ips: &[String])
        -> Result<(), BtsError>;

    /// Kill the BTS and transceiver processes; the stack's runloop restarts
    /// them. Blocks through the settle delay.
    async fn restart(&mut self) -> Result<(), BtsError>;

    /// Reinstate neighbor state the stack has dropped since the last tick.
    /// No-op for stacks that keep the neighbor list themselves.
    async fn reassert_neighbors(&mut self) -> Result<(), BtsError> {
        Ok(())
    }

    /// True once the unit has held off-level attenuation long enough that
    /// co-channel transmitters are measurable past it.
    fn is_off(&self) -> bool;

    /// True iff `TRX.RadioFrequencyOffset` still equals its factory default.
    /// A drifted offset makes measurement reports unreliable; callers treat
    /// `false` as fatal at startup.
    fn offset_correct(&self) -> Result<bool, BtsError>;
}

fn validate_arfcn(raw: u16) -> Result<Arfcn, BtsError> {
    Arfcn::new(raw).ok_or(BtsError::InvalidArfcn(raw))
}

// =============================================================================
// CONFIGURATION STORE
// =============================================================================

/// Read-only view of the stack's key-value configuration store.
/// Writes go through the command socket so the stack notices them.
pub struct ConfigDb {
    conn: Connection,
}

impl ConfigDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BtsError> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    pub fn get(&self, key: &str) -> Result<String, BtsError> {
        self.conn
            .query_row(
                "SELECT VALUESTRING FROM CONFIG WHERE KEYSTRING=?1",
                params![key],
                |row| row.get(0),
            )
            .map_err(|_| BtsError::MissingConfig(key.to_string()))
    }

    pub fn get_default(&self, key: &str) -> Result<String, BtsError> {
        self.conn
            .query_row(
                "SELECT DEFAULTVALUE FROM CONFIG WHERE KEYSTRING=?1",
                params![key],
                |row| row.get(0),
            )
            .map_err(|_| BtsError::MissingConfig(key.to_string()))
    }
}

// =============================================================================
// NEIGHBOR TABLE
// =============================================================================

/// The per-unit NeighborTable database. Column order differs between stack
/// versions, so the writer reads the live schema once at startup and builds
/// its insert statement from whatever it finds.
pub struct NeighborTable {
    conn: Connection,
    insert_sql: String,
    columns: Vec<String>,
}

impl NeighborTable {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BtsError> {
        Self::from_conn(Connection::open(path)?)
    }

    fn from_conn(conn: Connection) -> Result<Self, BtsError> {
        let mut columns = Self::read_schema(&conn)?;
        if columns.is_empty() {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS NEIGHBOR_TABLE (
                    IPADDRESS TEXT UNIQUE NOT NULL,
                    UPDATED INTEGER,
                    HOLDOFF INTEGER,
                    C0 INTEGER,
                    BSIC INTEGER
                );",
            )?;
            columns = Self::read_schema(&conn)?;
        }

        for col in &columns {
            match col.as_str() {
                "IPADDRESS" | "UPDATED" | "HOLDOFF" | "C0" | "BSIC" => {}
                other => return Err(BtsError::UnknownColumn(other.to_string())),
            }
        }

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let insert_sql = format!(
            "INSERT INTO NEIGHBOR_TABLE ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );

        Ok(Self {
            conn,
            insert_sql,
            columns,
        })
    }

    fn read_schema(conn: &Connection) -> Result<Vec<String>, BtsError> {
        let mut stmt = conn.prepare("PRAGMA table_info(NEIGHBOR_TABLE)")?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cols.into_iter().map(|c| c.to_uppercase()).collect())
    }

    /// Insert one fabricated row, first clearing any row with the same
    /// channel or the same address so the table stays unique on both.
    pub fn upsert_row(&self, ip: &str, arfcn: Arfcn) -> Result<(), BtsError> {
        let updated = Utc::now().timestamp() - FABRICATED_BACKDATE_SECS;

        self.conn.execute(
            "DELETE FROM NEIGHBOR_TABLE WHERE C0=?1",
            params![arfcn.get()],
        )?;
        self.conn
            .execute("DELETE FROM NEIGHBOR_TABLE WHERE IPADDRESS=?1", params![ip])?;

        let values: Vec<rusqlite::types::Value> = self
            .columns
            .iter()
            .map(|col| match col.as_str() {
                "IPADDRESS" => rusqlite::types::Value::Text(ip.to_string()),
                "UPDATED" => rusqlite::types::Value::Integer(updated),
                "HOLDOFF" => rusqlite::types::Value::Integer(FABRICATED_HOLDOFF_SECS),
                "C0" => rusqlite::types::Value::Integer(arfcn.get() as i64),
                "BSIC" => rusqlite::types::Value::Integer(FABRICATED_BSIC),
                _ => unreachable!("schema validated at open"),
            })
            .collect();

        self.conn
            .execute(&self.insert_sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }

    /// Channels currently present in the table. Used by the dual controller
    /// to spot rows the stack has dropped.
    pub fn current_c0s(&self) -> Result<Vec<u16>, BtsError> {
        let mut stmt = self.conn.prepare("SELECT C0 FROM NEIGHBOR_TABLE")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, u16>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// =============================================================================
// ATTENUATION BOOKKEEPING
// =============================================================================

/// Tracks when the unit crossed into off-level attenuation.
struct AttenState {
    off_since: Option<Instant>,
}

impl AttenState {
    fn new() -> Self {
        Self { off_since: None }
    }

    fn mark(&mut self, atten_db: u32) {
        if atten_db >= ATTEN_LADDER_DB[3] {
            self.off_since.get_or_insert_with(Instant::now);
        } else {
            self.off_since = None;
        }
    }

    fn is_off(&self) -> bool {
        self.off_since
            .is_some_and(|t| t.elapsed() >= Duration::from_secs(OFF_HOLD_SECS))
    }
}

async fn kill_processes(process: &str, transceiver: &str) -> Result<(), BtsError> {
    tokio::process::Command::new("killall")
        .arg(process)
        .arg(transceiver)
        .status()
        .await?;
    tokio::time::sleep(Duration::from_secs(RESTART_SETTLE_SECS)).await;
    Ok(())
}

// =============================================================================
// NEIGHBOR-TABLE DRIVEN STACKS
// =============================================================================

/// Driver for stacks with the handover NeighborTable.
pub struct OpenBts {
    id: usize,
    process_name: String,
    transceiver_name: String,
    config_db: ConfigDb,
    cli: CmdSocket,
    neighbor_table: NeighborTable,
    fake_subnet: &'static str,
    /// Per-unit peering port; carried here so neighbor re-assertion always
    /// has it in scope.
    neighbor_port: Option<u16>,
    atten: AttenState,
    /// Fabricated (ip, arfcn) rows from the last `set_neighbors`, re-asserted
    /// by `reassert_neighbor_rows`.
    fabricated: Vec<(String, Arfcn)>,
}

impl OpenBts {
    /// Connect to one unit: configuration store, command socket, and the
    /// NeighborTable the stack names in `Peering.NeighborTable.Path`.
    pub async fn connect<P: AsRef<Path>>(
        id: usize,
        openbtsdb: P,
        process_name: &str,
        transceiver_name: &str,
        neighbor_port: Option<u16>,
    ) -> Result<Self, BtsError> {
        let config_db = ConfigDb::open(openbtsdb)?;
        let socket_path = config_db.get("CLI.SocketPath")?;
        let cli = CmdSocket::connect(&socket_path)?;

        let reply = cli.command("config Peering.NeighborTable.Path").await?;
        let nt_path = reply
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| BtsError::MissingConfig("Peering.NeighborTable.Path".into()))?;
        let neighbor_table = NeighborTable::open(nt_path)?;

        Ok(Self {
            id,
            process_name: process_name.to_string(),
            transceiver_name: transceiver_name.to_string(),
            config_db,
            cli,
            neighbor_table,
            fake_subnet: if neighbor_port.is_some() {
                FAKE_SUBNET_DUAL
            } else {
                FAKE_SUBNET_SINGLE
            },
            neighbor_port,
            atten: AttenState::new(),
            fabricated: Vec::new(),
        })
    }

    fn row_addr(&self, host: &str) -> String {
        format!("{host}:{}", self.neighbor_port.unwrap_or(DEFAULT_PEER_PORT))
    }

    /// Re-insert fabricated rows the stack has dropped since the last tick.
    /// The stack deletes rows it cannot re-peer with, so this runs every
    /// controller tick in dual mode.
    pub fn reassert_neighbor_rows(&self) -> Result<(), BtsError> {
        let present = self.neighbor_table.current_c0s()?;
        for (ip, arfcn) in &self.fabricated {
            if !present.contains(&arfcn.get()) {
                debug!(bts = self.id, %arfcn, "reinstating dropped neighbor row");
                self.neighbor_table.upsert_row(ip, *arfcn)?;
            }
        }
        Ok(())
    }
}

impl Bts for OpenBts {
    fn id(&self) -> usize {
        self.id
    }

    fn current_arfcn(&self) -> Result<Arfcn, BtsError> {
        let raw: u16 = self
            .config_db
            .get("GSM.Radio.C0")?
            .trim()
            .parse()
            .map_err(|_| BtsError::MissingConfig("GSM.Radio.C0".into()))?;
        validate_arfcn(raw)
    }

    async fn change_arfcn(&mut self, new_arfcn: u16, immediate: bool) -> Result<(), BtsError> {
        let arfcn = match validate_arfcn(new_arfcn) {
            Ok(arfcn) => arfcn,
            Err(e) => {
                error!(bts = self.id, arfcn = new_arfcn, "invalid ARFCN rejected");
                return Err(e);
            }
        };

        self.cli
            .command(&format!("config GSM.Radio.C0 {arfcn}"))
            .await?;
        warn!(bts = self.id, %arfcn, "updated next ARFCN");

        if immediate {
            self.restart().await?;
        }
        Ok(())
    }

    async fn set_txatten(&mut self, atten_db: u32) -> Result<(), BtsError> {
        self.cli.command(&format!("txatten {atten_db}")).await?;
        self.atten.mark(atten_db);
        debug!(bts = self.id, atten_db, "transmit attenuation set");
        Ok(())
    }

    async fn set_neighbors(
        &mut self,
        arfcns: &[Arfcn],
        real_ips: &[String],
    ) -> Result<(), BtsError> {
        let num_real = real_ips.len().min(arfcns.len());

        let fake_hosts: Vec<String> = (0..arfcns.len() - num_real)
            .map(|i| format!("{}{}", self.fake_subnet, i + 1))
            .collect();

        let mut neighbor_list: Vec<String> = real_ips[..num_real].to_vec();
        match self.neighbor_port {
            Some(port) => neighbor_list.extend(fake_hosts.iter().map(|h| format!("{h}:{port}"))),
            None => neighbor_list.extend(fake_hosts.iter().cloned()),
        }

        // Register the addresses first: rows for unregistered IPs get purged.
        self.cli
            .command(&format!("config GSM.Neighbors {}", neighbor_list.join(" ")))
            .await?;

        self.fabricated = fake_hosts
            .iter()
            .zip(arfcns[num_real..].iter())
            .map(|(host, &arfcn)| (self.row_addr(host), arfcn))
            .collect();
        for (ip, arfcn) in &self.fabricated {
            self.neighbor_table.upsert_row(ip, *arfcn)?;
        }

        info!(
            bts = self.id,
            neighbors = ?arfcns.iter().map(|a| a.get()).collect::<Vec<_>>(),
            real = num_real,
            "neighbor list set"
        );
        Ok(())
    }

    async fn restart(&mut self) -> Result<(), BtsError> {
        warn!(bts = self.id, process = %self.process_name, "restarting BTS");
        kill_processes(&self.process_name, &self.transceiver_name).await
    }

    async fn reassert_neighbors(&mut self) -> Result<(), BtsError> {
        self.reassert_neighbor_rows()
    }

    fn is_off(&self) -> bool {
        self.atten.is_off()
    }

    fn offset_correct(&self) -> Result<bool, BtsError> {
        let value = self.config_db.get("TRX.RadioFrequencyOffset")?;
        let default = self.config_db.get_default("TRX.RadioFrequencyOffset")?;
        Ok(value.trim() == default.trim())
    }
}

// =============================================================================
// LEGACY STACKS
// =============================================================================

/// Driver for older stacks without a NeighborTable: the neighbor list is the
/// `GSM.CellSelection.Neighbors` config key, as channel numbers.
pub struct LegacyBts {
    id: usize,
    process_name: String,
    transceiver_name: String,
    config_db: ConfigDb,
    cli: CmdSocket,
    atten: AttenState,
}

impl LegacyBts {
    pub fn connect<P: AsRef<Path>>(
        id: usize,
        openbtsdb: P,
        process_name: &str,
        transceiver_name: &str,
    ) -> Result<Self, BtsError> {
        let config_db = ConfigDb::open(openbtsdb)?;
        let socket_path = config_db.get("CLI.SocketPath")?;
        let cli = CmdSocket::connect(&socket_path)?;
        Ok(Self {
            id,
            process_name: process_name.to_string(),
            transceiver_name: transceiver_name.to_string(),
            config_db,
            cli,
            atten: AttenState::new(),
        })
    }
}

impl Bts for LegacyBts {
    fn id(&self) -> usize {
        self.id
    }

    fn current_arfcn(&self) -> Result<Arfcn, BtsError> {
        let raw: u16 = self
            .config_db
            .get("GSM.Radio.C0")?
            .trim()
            .parse()
            .map_err(|_| BtsError::MissingConfig("GSM.Radio.C0".into()))?;
        validate_arfcn(raw)
    }

    async fn change_arfcn(&mut self, new_arfcn: u16, immediate: bool) -> Result<(), BtsError> {
        let arfcn = match validate_arfcn(new_arfcn) {
            Ok(arfcn) => arfcn,
            Err(e) => {
                error!(bts = self.id, arfcn = new_arfcn, "invalid ARFCN rejected");
                return Err(e);
            }
        };

        self.cli
            .command(&format!("config GSM.Radio.C0 {arfcn}"))
            .await?;
        warn!(bts = self.id, %arfcn, "updated next ARFCN");

        if immediate {
            self.restart().await?;
        }
        Ok(())
    }

    async fn set_txatten(&mut self, atten_db: u32) -> Result<(), BtsError> {
        self.cli.command(&format!("txatten {atten_db}")).await?;
        self.atten.mark(atten_db);
        Ok(())
    }

    async fn set_neighbors(
        &mut self,
        arfcns: &[Arfcn],
        _real_ips: &[String],
    ) -> Result<(), BtsError> {
        let list = arfcns
            .iter()
            .map(|a| a.get().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.cli
            .command(&format!("config GSM.CellSelection.Neighbors {list}"))
            .await?;
        info!(bts = self.id, neighbors = %list, "neighbor list set");
        Ok(())
    }

    async fn restart(&mut self) -> Result<(), BtsError> {
        warn!(bts = self.id, process = %self.process_name, "restarting BTS");
        kill_processes(&self.process_name, &self.transceiver_name).await
    }

    fn is_off(&self) -> bool {
        self.atten.is_off()
    }

    fn offset_correct(&self) -> Result<bool, BtsError> {
        let value = self.config_db.get("TRX.RadioFrequencyOffset")?;
        let default = self.config_db.get_default("TRX.RadioFrequencyOffset")?;
        Ok(value.trim() == default.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arfcn(raw: u16) -> Arfcn {
        Arfcn::new(raw).unwrap()
    }

    #[test]
    fn arfcn_validation_bounds() {
        assert!(validate_arfcn(0).is_err());
        assert!(validate_arfcn(125).is_err());
        assert!(validate_arfcn(1).is_ok());
        assert!(validate_arfcn(124).is_ok());
    }

    #[test]
    fn neighbor_table_unique_by_channel_and_address() {
        let table = NeighborTable::from_conn(Connection::open_in_memory().unwrap()).unwrap();

        table.upsert_row("127.0.10.1:16001", arfcn(40)).unwrap();
        table.upsert_row("127.0.10.2:16001", arfcn(41)).unwrap();
        // Same channel from a new address replaces the old row.
        table.upsert_row("127.0.10.3:16001", arfcn(40)).unwrap();
        // Same address with a new channel replaces again.
        table.upsert_row("127.0.10.3:16001", arfcn(42)).unwrap();

        let mut c0s = table.current_c0s().unwrap();
        c0s.sort_unstable();
        assert_eq!(c0s, vec![41, 42]);
    }

    #[test]
    fn neighbor_table_adapts_to_reordered_schema() {
        let conn = Connection::open_in_memory().unwrap();
        // Some stack versions keep BSIC fourth.
        conn.execute_batch(
            "CREATE TABLE NEIGHBOR_TABLE (
                IPADDRESS TEXT UNIQUE NOT NULL,
                UPDATED INTEGER,
                HOLDOFF INTEGER,
                BSIC INTEGER,
                C0 INTEGER
            );",
        )
        .unwrap();
        let table = NeighborTable::from_conn(conn).unwrap();
        table.upsert_row("127.0.9.1:16001", arfcn(30)).unwrap();

        let (c0, bsic): (u16, i64) = table
            .conn
            .query_row("SELECT C0, BSIC FROM NEIGHBOR_TABLE", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(c0, 30);
        assert_eq!(bsic, FABRICATED_BSIC);
    }

    #[test]
    fn neighbor_table_rejects_foreign_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE NEIGHBOR_TABLE (IPADDRESS TEXT, MYSTERY INTEGER);")
            .unwrap();
        assert!(matches!(
            NeighborTable::from_conn(conn),
            Err(BtsError::UnknownColumn(c)) if c == "MYSTERY"
        ));
    }

    #[test]
    fn atten_state_needs_hold_time() {
        let mut atten = AttenState::new();
        atten.mark(ATTEN_LADDER_DB[3]);
        // Just crossed: not off yet.
        assert!(!atten.is_off());
        atten.off_since = Some(Instant::now() - Duration::from_secs(OFF_HOLD_SECS + 1));
        assert!(atten.is_off());
        atten.mark(ATTEN_LADDER_DB[0]);
        assert!(!atten.is_off());
    }
}
