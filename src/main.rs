//! gsmws — dynamic-spectrum controller for GSM 900 base stations.
//!
//! Parses a packet dissector's verbose GSMTAP output, maintains a
//! per-channel signal-strength estimate in `gsmws.db`, and steers one BTS
//! (or a co-located handover pair with `--dual`) onto channels that look
//! unused.

use clap::Parser;
use gsmws::bts::{Bts, OpenBts, DEFAULT_PEER_PORT};
use gsmws::controller::Controller;
use gsmws::decoder::{self, DecoderHandle, SharedStore};
use gsmws::handover::{BtsUnit, HandoverController};
use gsmws::store::ObservationStore;
use gsmws::stream::{command_stream, RecordStream, DEFAULT_DISSECTOR_CMD};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "gsmws", version, about = "GSM whitespace spectrum controller")]
struct Args {
    /// OpenBTS.db location
    #[arg(long, default_value = "/etc/OpenBTS/OpenBTS.db")]
    openbtsdb: PathBuf,

    /// BTS process name
    #[arg(long, default_value = "OpenBTS")]
    openbts: String,

    /// Transceiver process name
    #[arg(long, default_value = "transceiver")]
    transceiver: String,

    /// Seconds before switching to a new set of neighbors to scan
    #[arg(short, long, default_value_t = gsmws::types::NEIGHBOR_CYCLE_SECS)]
    cycle: u64,

    /// Seconds to sleep between RSSI checks
    #[arg(short, long, default_value_t = gsmws::types::SLEEP_SECS)]
    sleep: u64,

    /// Where to keep the gsmws.db observation store
    #[arg(long, default_value = "gsmws.db")]
    gsmwsdb: PathBuf,

    /// Dissector command to run (per unit in dual mode)
    #[arg(long)]
    cmd: Option<String>,

    /// Read dissector output from STDIN
    #[arg(long, conflicts_with = "dual")]
    stdin: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Drive two co-located units as a handover scanning pair
    #[arg(long, requires = "openbtsdb2")]
    dual: bool,

    /// Second unit's OpenBTS.db location (dual mode)
    #[arg(long)]
    openbtsdb2: Option<PathBuf>,
}

/// Spawn one decoder worker over the configured dissector source. The child
/// handle, when present, must outlive the worker.
fn spawn_decoder(
    handle: DecoderHandle,
    store: SharedStore,
    cmd: Option<&str>,
    use_stdin: bool,
) -> Result<Option<tokio::process::Child>, Box<dyn std::error::Error>> {
    if use_stdin {
        let stream = RecordStream::new(tokio::io::stdin());
        tokio::spawn(decoder::run(handle, store, stream));
        return Ok(None);
    }

    let command = cmd.unwrap_or(DEFAULT_DISSECTOR_CMD);
    info!(%command, decoder = handle.id(), "starting dissector");
    let (child, stdout) = command_stream(command)?;
    tokio::spawn(decoder::run(handle, store, RecordStream::new(stdout)));
    Ok(Some(child))
}

fn check_offset<B: Bts>(bts: &B) -> Result<(), Box<dyn std::error::Error>> {
    if !bts.offset_correct()? {
        return Err(format!(
            "unit {}: TRX.RadioFrequencyOffset differs from its default; \
             measurement reports would be unreliable",
            bts.id()
        )
        .into());
    }
    Ok(())
}

async fn run_single(args: &Args, store: SharedStore) -> Result<(), Box<dyn std::error::Error>> {
    let bts = OpenBts::connect(0, &args.openbtsdb, &args.openbts, &args.transceiver, None).await?;
    check_offset(&bts)?;

    let handle = DecoderHandle::new(0);
    let _child = spawn_decoder(handle.clone(), store.clone(), args.cmd.as_deref(), args.stdin)?;

    let mut controller = Controller::new(
        bts,
        handle,
        store,
        Duration::from_secs(args.cycle),
        Duration::from_secs(args.sleep),
    );

    tokio::select! {
        _ = controller.run() => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }
    Ok(())
}

async fn run_dual(args: &Args, store: SharedStore) -> Result<(), Box<dyn std::error::Error>> {
    let db2 = args
        .openbtsdb2
        .as_ref()
        .ok_or("--dual requires --openbtsdb2")?;

    let port0 = DEFAULT_PEER_PORT;
    let port1 = DEFAULT_PEER_PORT + 10;
    let bts0 = OpenBts::connect(
        0,
        &args.openbtsdb,
        &args.openbts,
        &args.transceiver,
        Some(port0),
    )
    .await?;
    let bts1 = OpenBts::connect(1, db2, &args.openbts, &args.transceiver, Some(port1)).await?;
    check_offset(&bts0)?;
    check_offset(&bts1)?;

    let handle0 = DecoderHandle::new(0);
    let handle1 = DecoderHandle::new(1);
    let _child0 = spawn_decoder(handle0.clone(), store.clone(), args.cmd.as_deref(), false)?;
    let _child1 = spawn_decoder(handle1.clone(), store.clone(), args.cmd.as_deref(), false)?;

    let mut controller = HandoverController::new(
        BtsUnit::new(bts0, handle0, format!("127.0.0.1:{port0}")),
        BtsUnit::new(bts1, handle1, format!("127.0.0.1:{port1}")),
        store,
        Duration::from_secs(args.cycle),
        Duration::from_secs(args.sleep),
    );

    tokio::select! {
        _ = controller.run() => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_directive = if args.debug { "gsmws=debug" } else { "gsmws=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_directive.parse().unwrap()),
        )
        .init();

    info!("gsmws v{VERSION} starting");
    info!(
        cycle_secs = args.cycle,
        sleep_secs = args.sleep,
        dual = args.dual,
        gsmwsdb = %args.gsmwsdb.display(),
        "configuration"
    );

    let store: SharedStore = match ObservationStore::open(&args.gsmwsdb) {
        Ok(store) => Arc::new(Mutex::new(store)),
        Err(e) => {
            error!(error = %e, db = %args.gsmwsdb.display(), "cannot open observation store");
            std::process::exit(1);
        }
    };

    let result = if args.dual {
        run_dual(&args, store).await
    } else {
        run_single(&args, store).await
    };

    if let Err(e) = result {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}
