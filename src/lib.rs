pub mod bts;
pub mod cli;
pub mod controller;
pub mod decoder;
pub mod gsm;
pub mod handover;
pub mod store;
pub mod stream;
pub mod types;

pub use bts::{Bts, BtsError, ConfigDb, LegacyBts, NeighborTable, OpenBts};
pub use cli::{CliError, CmdSocket};
pub use controller::Controller;
pub use decoder::{DecoderHandle, ReportLog, SharedStore};
pub use gsm::{GsmError, MeasurementReport, RecordKind, SysInfo2, TapHeader};
pub use handover::{schedule_state, BtsUnit, HandoverController};
pub use store::{ObservationStore, StoreError};
pub use stream::{command_stream, RecordStream, DEFAULT_DISSECTOR_CMD};
pub use types::*;
