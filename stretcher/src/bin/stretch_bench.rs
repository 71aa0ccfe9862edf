//! Bench controller for the sample stretcher.
//!
//! Wires the control core together for day-to-day protocol runs:
//! - `run`: countdown then symmetric stretch, optionally gated on the
//!   pointer trigger (`--armed`)
//! - `home`: home both stages
//! - `move` / `rest`: manual length moves
//! - `watch`: poll and print sample length and run status
//! - `stop`: stop both stages
//!
//! Calibration comes from a JSON rig config (`--config`); without one the
//! reference rig's constants are used.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use hardware::zaber::StageLink;
use stretcher::{
    BenchEvent, ProtocolSequencer, RigConfig, RunStatus, SequencerError, StagePair, StatusPoller,
    StretchParams, TriggerArmer, TriggerSignal,
};
use tracing::{info, warn};

/// How long to keep watching for motion after a move was issued before
/// concluding it finished between polls.
const MOVE_OBSERVE_WINDOW: Duration = Duration::from_secs(5);

/// Stretch protocol bench controller
#[derive(Parser, Debug)]
#[command(name = "stretch_bench")]
#[command(about = "Protocol controller for the dual-stage sample stretcher")]
#[command(version)]
struct Args {
    /// Rig config JSON; built-in calibration if omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port; overrides the config value
    #[arg(long, global = true)]
    port: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the stretch protocol: countdown, then the symmetric move
    Run {
        /// Target strain in % of rest length
        #[arg(long)]
        strain: Option<f64>,

        /// Strain rate in % of rest length per second
        #[arg(long)]
        rate: Option<f64>,

        /// Target sample length in mm (alternative to --strain)
        #[arg(long)]
        target: Option<f64>,

        /// Move speed in mm/s (pairs with --target)
        #[arg(long)]
        speed: Option<f64>,

        /// Countdown seconds between commit and motion
        #[arg(long)]
        pause: Option<u64>,

        /// Gate the run on the pointer trigger: three primary-button
        /// releases commit, three secondary releases cancel
        #[arg(long)]
        armed: bool,
    },

    /// Home both stages (does not wait for completion)
    Home,

    /// Move the sample to an absolute length
    Move {
        /// Target sample length in mm
        length: f64,

        /// Speed in mm/s; config default if omitted
        #[arg(long)]
        speed: Option<f64>,
    },

    /// Return the sample to its rest length
    Rest {
        /// Speed in mm/s; config default if omitted
        #[arg(long)]
        speed: Option<f64>,
    },

    /// Poll and print sample length and run status
    Watch {
        /// Stop after this many seconds; runs until interrupted if omitted
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Stop both stages
    Stop,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RigConfig::load_from_file(path)
            .with_context(|| format!("loading rig config from {}", path.display()))?,
        None => RigConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    let link = Arc::new(Mutex::new(StageLink::with_scale(config.scale())));
    let pair = StagePair::new(link, config.zero_position, config.rest_length_mm);

    info!("Connecting to stage pair on {}...", config.port);
    pair.connect(&config.port)?;

    let result = dispatch(args.command, &pair, &config);
    pair.disconnect().ok();
    result
}

fn dispatch(command: Command, pair: &StagePair, config: &RigConfig) -> Result<()> {
    match command {
        Command::Run {
            strain,
            rate,
            target,
            speed,
            pause,
            armed,
        } => {
            let params = build_params(config, strain, rate, target, speed, pause)?;
            run_protocol(pair, config, params, armed)
        }
        Command::Home => {
            pair.home()?;
            println!("homing started");
            Ok(())
        }
        Command::Move { length, speed } => {
            let speed = speed.unwrap_or(config.default_speed_mm_per_sec);
            pair.move_to_length(length, speed)?;
            println!("moving to {length} mm at {speed} mm/s");
            Ok(())
        }
        Command::Rest { speed } => {
            let speed = speed.unwrap_or(config.default_speed_mm_per_sec);
            pair.return_to_rest(speed)?;
            println!("returning to rest length ({} mm)", config.rest_length_mm);
            Ok(())
        }
        Command::Watch { seconds } => watch(pair, config, seconds),
        Command::Stop => {
            pair.stop()?;
            println!("both stages stopped");
            Ok(())
        }
    }
}

/// Resolve CLI parameters against config defaults. The strain form is
/// canonical; `--target`/`--speed` convert at this boundary.
fn build_params(
    config: &RigConfig,
    strain: Option<f64>,
    rate: Option<f64>,
    target: Option<f64>,
    speed: Option<f64>,
    pause: Option<u64>,
) -> Result<StretchParams> {
    let pause = pause.unwrap_or(config.default_pause_s);

    if target.is_some() || speed.is_some() {
        if strain.is_some() || rate.is_some() {
            bail!("--target/--speed and --strain/--rate are mutually exclusive");
        }
        let target = target.context("--target is required when --speed is given")?;
        let speed = speed.context("--speed is required when --target is given")?;
        Ok(StretchParams::from_target_length(
            config.rest_length_mm,
            target,
            speed,
            pause,
        )?)
    } else {
        Ok(StretchParams::from_strain(
            config.rest_length_mm,
            strain.unwrap_or(config.default_strain_pct),
            rate.unwrap_or(config.default_strain_rate_pct_per_sec),
            pause,
        )?)
    }
}

fn run_protocol(
    pair: &StagePair,
    config: &RigConfig,
    params: StretchParams,
    armed: bool,
) -> Result<()> {
    println!(
        "protocol: {:.3} mm -> {:.3} mm at {:.4} mm/s, {} s pause",
        params.rest_length_mm(),
        params.target_length_mm(),
        params.speed_mm_per_sec(),
        params.pause_s()
    );

    let (events_tx, events_rx) = unbounded();
    let poller = StatusPoller::start(
        pair.clone(),
        Duration::from_millis(config.poll_interval_ms),
        events_tx.clone(),
    );

    let (armer, trigger_rx) = if armed {
        let (armer, rx) = arm_pointer_trigger()?;
        (Some(armer), Some(rx))
    } else {
        (None, None)
    };

    let worker_pair = pair.clone();
    let worker = thread::spawn(move || -> Result<(), SequencerError> {
        protocol_worker(worker_pair, events_tx, trigger_rx, params)
    });

    let outcome = print_until_settled(&events_rx, &worker);
    let result = worker
        .join()
        .map_err(|_| anyhow!("protocol thread panicked"))?;
    // after a terminal signal the listener has already exited; otherwise
    // this tears it down without firing
    drop(armer);
    poller.stop();
    result?;

    match outcome {
        RunOutcome::Cancelled => println!("run cancelled by trigger"),
        RunOutcome::Settled => println!("run complete"),
        RunOutcome::Unobserved => {
            println!("move issued; no motion observed (may have finished between polls)")
        }
        RunOutcome::NeverMoved => println!("run ended without a move"),
    }
    Ok(())
}

/// The armed wait plus countdown and move, on its own thread so the main
/// thread can print events as they happen.
fn protocol_worker(
    pair: StagePair,
    events: Sender<BenchEvent>,
    trigger_rx: Option<Receiver<TriggerSignal>>,
    params: StretchParams,
) -> Result<(), SequencerError> {
    let mut sequencer = ProtocolSequencer::new(pair, events.clone());

    if let Some(signals) = trigger_rx {
        sequencer.arm()?;
        let mut committed = false;
        for signal in signals.iter() {
            match signal {
                TriggerSignal::Count { primary, secondary } => {
                    sequencer.note_count();
                    let _ = events.send(BenchEvent::TriggerCount { primary, secondary });
                }
                TriggerSignal::Committed => {
                    let _ = events.send(BenchEvent::TriggerCommitted);
                    committed = true;
                    break;
                }
                TriggerSignal::Cancelled => {
                    let _ = events.send(BenchEvent::TriggerCancelled);
                    sequencer.cancel()?;
                    return Ok(());
                }
            }
        }
        if !committed {
            warn!("trigger source ended without a signal; standing down");
            return Ok(());
        }
    }

    sequencer.commit(&params)
}

#[cfg(target_os = "linux")]
fn arm_pointer_trigger() -> Result<(TriggerArmer, Receiver<TriggerSignal>)> {
    use stretcher::MiceSource;

    let source = MiceSource::open().context("opening /dev/input/mice")?;
    let (tx, rx) = unbounded();
    let armer = TriggerArmer::arm(Box::new(source), tx);
    println!("trigger armed: 3 left clicks to start, 3 right clicks to cancel");
    Ok((armer, rx))
}

#[cfg(not(target_os = "linux"))]
fn arm_pointer_trigger() -> Result<(TriggerArmer, Receiver<TriggerSignal>)> {
    bail!("--armed reads /dev/input/mice and is only available on Linux")
}

enum RunOutcome {
    Cancelled,
    Settled,
    Unobserved,
    NeverMoved,
}

/// Print events until the run settles: the move was issued and the poller
/// saw motion stop, the trigger cancelled, or nothing moved within the
/// observation window.
fn print_until_settled(
    events: &Receiver<BenchEvent>,
    worker: &thread::JoinHandle<Result<(), SequencerError>>,
) -> RunOutcome {
    let mut printer = EventPrinter::new();
    let mut move_issued_at: Option<Instant> = None;
    let mut saw_running = false;

    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                printer.print(&event);
                match event {
                    BenchEvent::TriggerCancelled => return RunOutcome::Cancelled,
                    BenchEvent::MoveStarted { .. } => move_issued_at = Some(Instant::now()),
                    BenchEvent::Status(RunStatus::Running) if move_issued_at.is_some() => {
                        saw_running = true;
                    }
                    BenchEvent::Status(RunStatus::Idle) if saw_running => {
                        return RunOutcome::Settled;
                    }
                    _ => {}
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // a timeout means nothing is buffered, so a finished
                // worker really did end without issuing a move: commit
                // failed or the trigger never fired
                if move_issued_at.is_none() && worker.is_finished() {
                    return RunOutcome::NeverMoved;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return RunOutcome::Unobserved,
        }

        if let Some(issued) = move_issued_at {
            if !saw_running && issued.elapsed() > MOVE_OBSERVE_WINDOW {
                return RunOutcome::Unobserved;
            }
        }
    }
}

fn watch(pair: &StagePair, config: &RigConfig, seconds: Option<u64>) -> Result<()> {
    let (events_tx, events_rx) = unbounded();
    let poller = StatusPoller::start(
        pair.clone(),
        Duration::from_millis(config.poll_interval_ms),
        events_tx,
    );

    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut printer = EventPrinter::new();

    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }
        match events_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => printer.print(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    poller.stop();
    Ok(())
}

/// Prints bus events, throttling the length stream to one line a second.
struct EventPrinter {
    last_length_print: Option<Instant>,
}

impl EventPrinter {
    fn new() -> Self {
        Self {
            last_length_print: None,
        }
    }

    fn print(&mut self, event: &BenchEvent) {
        match event {
            BenchEvent::CountdownTick { seconds_remaining } => {
                println!("starting in {seconds_remaining} s");
            }
            BenchEvent::MoveStarted {
                target_mm,
                speed_mm_per_sec,
            } => {
                println!("moving to {target_mm:.3} mm at {speed_mm_per_sec:.4} mm/s");
            }
            BenchEvent::Status(status) => println!("status: {status}"),
            BenchEvent::Length { mm } => {
                let due = self
                    .last_length_print
                    .map_or(true, |t| t.elapsed() >= Duration::from_secs(1));
                if due {
                    self.last_length_print = Some(Instant::now());
                    println!("length: {mm:.4} mm");
                }
            }
            BenchEvent::TriggerCount { primary, secondary } => {
                println!("trigger: {primary} commit / {secondary} cancel releases");
            }
            BenchEvent::TriggerCommitted => println!("trigger committed"),
            BenchEvent::TriggerCancelled => println!("trigger cancelled"),
        }
    }
}
