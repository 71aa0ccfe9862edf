//! CLI tool for bring-up and manual control of the stretcher stages.
//!
//! Talks the binary protocol directly in device units (microsteps), one
//! subcommand per primitive:
//! - `detect`: open the port and report the discovered stages
//! - `home`: home one stage or the whole chain
//! - `move-abs` / `move-rel`: issue position moves
//! - `speed`: set a stage's target speed in mm/s
//! - `position`: read both stage positions
//! - `status`: read both firmware statuses
//! - `settings`: read back speed and travel-limit registers
//! - `stop`: stop one stage or the whole chain

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use hardware::zaber::{setting, StageId, StageLink};
use tracing::info;

/// Default serial port for the stage chain
const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Stretcher stage control tool
#[derive(Parser, Debug)]
#[command(name = "stage_tool")]
#[command(about = "Manual control tool for the stretcher stage pair")]
#[command(version)]
struct Args {
    /// Serial port the stage chain is attached to
    #[arg(long, global = true, default_value = DEFAULT_PORT)]
    port: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the port and report the discovered stages
    Detect,

    /// Home one stage, or broadcast home to the whole chain
    Home {
        /// Stage to home (1 or 2); homes the whole chain if omitted
        #[arg(short, long)]
        stage: Option<u8>,
    },

    /// Move a stage to an absolute position in microsteps
    MoveAbs {
        /// Stage to move (1 or 2)
        #[arg(short, long)]
        stage: u8,

        /// Target position in microsteps
        position: i32,
    },

    /// Move a stage by a signed offset in microsteps
    MoveRel {
        /// Stage to move (1 or 2)
        #[arg(short, long)]
        stage: u8,

        /// Signed offset in microsteps
        delta: i32,
    },

    /// Set a stage's target speed
    Speed {
        /// Stage to configure (1 or 2)
        #[arg(short, long)]
        stage: u8,

        /// Target speed in mm/s
        mm_per_sec: f64,
    },

    /// Read both stage positions
    Position,

    /// Read both stage firmware statuses
    Status,

    /// Read back each stage's speed and travel-limit registers
    Settings,

    /// Stop one stage, or broadcast stop to the whole chain
    Stop {
        /// Stage to stop (1 or 2); stops the whole chain if omitted
        #[arg(short, long)]
        stage: Option<u8>,
    },
}

fn stage_id(stage: u8) -> Result<StageId> {
    match stage {
        1 => Ok(StageId::One),
        2 => Ok(StageId::Two),
        other => bail!("stage must be 1 or 2, got {other}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Connecting to stage chain on {}...", args.port);
    let mut link = StageLink::new();
    link.connect(&args.port)?;

    match args.command {
        Command::Detect => {
            let devices = link.device_numbers();
            println!("stage 1: device {}", devices[0]);
            println!("stage 2: device {}", devices[1]);
        }
        Command::Home { stage } => match stage {
            Some(stage) => link.home(stage_id(stage)?)?,
            None => link.home_all()?,
        },
        Command::MoveAbs { stage, position } => {
            link.move_absolute(stage_id(stage)?, position)?;
        }
        Command::MoveRel { stage, delta } => {
            link.move_relative(stage_id(stage)?, delta)?;
        }
        Command::Speed { stage, mm_per_sec } => {
            link.set_target_speed(stage_id(stage)?, mm_per_sec)?;
        }
        Command::Position => {
            let scale = link.scale();
            for id in StageId::ALL {
                let steps = link.read_position(id)?;
                println!("stage {id}: {steps} steps ({:.4} mm)", scale.steps_to_mm(steps));
            }
        }
        Command::Status => {
            for id in StageId::ALL {
                let status = link.status(id)?;
                println!("stage {id}: {status:?}");
            }
        }
        Command::Settings => {
            let scale = link.scale();
            for id in StageId::ALL {
                let speed = link.read_setting(id, setting::TARGET_SPEED)?;
                let max = link.read_setting(id, setting::MAXIMUM_POSITION)?;
                println!(
                    "stage {id}: target speed {speed}, maximum position {max} steps ({:.2} mm)",
                    scale.steps_to_mm(max)
                );
            }
        }
        Command::Stop { stage } => match stage {
            Some(stage) => link.stop(stage_id(stage)?)?,
            None => link.stop_all()?,
        },
    }

    Ok(())
}
