//! Headless entry point: load a position, repair its annotations,
//! optionally relabel and save.

use std::path::PathBuf;
use std::process::ExitCode;

use acdc::config::ConfigStore;
use acdc::prompt::AutoAccept;
use acdc::{Engine, Mode, logging};
use clap::Parser;

/// Repair, relabel and save a Cell-ACDC position folder
#[derive(Parser)]
#[command(name = "acdc-native", version)]
struct Cli {
    /// Position folder (the one holding `Images/`)
    position_dir: PathBuf,

    /// Segmentation end name, e.g. `_v2` for `<basename>_segm_v2.npz`
    #[arg(long)]
    endname: Option<String>,

    /// Renumber objects to 1..N across the position
    #[arg(long)]
    relabel: bool,

    /// Write the segmentation and the annotation table
    #[arg(long)]
    save: bool,

    /// Write the log to this file instead of stderr
    #[arg(long)]
    session_log: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("acdc-native: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigStore::load_at_init();
    logging::init(config.get().log_level, cli.session_log.as_deref())?;

    let mut engine = Engine::open(&cli.position_dir, cli.endname.as_deref(), config, Box::new(AutoAccept))?
        .with_session_log(cli.session_log.clone());
    let pos = engine.position();
    log::info!(
        "Opened '{}' ({} frames, {}D segmentation)",
        pos.name(),
        pos.size_t(),
        if pos.is_3d() { 3 } else { 2 }
    );

    let last = pos.disk.last_nonempty();
    let mut repaired = 0;
    if let Some(last) = last {
        for i in 0..=last {
            if !engine.repair_frame(i)?.is_clean() {
                repaired += 1;
            }
        }
    }
    println!("Repaired {} frame(s)", repaired);

    if cli.relabel {
        if engine.mode() == Mode::Viewer {
            engine.set_mode(Mode::SegmentationTracking)?;
        }
        let mapping = engine.relabel()?;
        let changed = mapping.iter().filter(|(old, new)| old != new).count();
        println!("Relabelled {} object(s)", changed);
    }

    if cli.save {
        let outcome = engine.save()?;
        println!("Saved {} frame(s)", outcome.frames_written);
        if let Some(backup) = outcome.backup {
            println!("Previous table archived as {}", backup);
        }
    }

    engine.close(false)?;
    Ok(())
}
