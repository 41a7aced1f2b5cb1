use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use igus_motion::driver::{ComplianceMode, KeyframeCommand};
use igus_motion::keyframe::load_keyframes;
use igus_motion::timeline::Timeline;
use igus_motion::{JointTable, SERVO_SPEED_MAX};
use tracing_subscriber::EnvFilter;

mod monitor;
mod play;
mod probe;
mod session;

use session::Session;

/// Operator tool for the robolink arm.
#[derive(Parser, Debug)]
#[command(name = "motion_cli", version, about)]
struct Cli {
    #[command(flatten)]
    connection: Connection,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct Connection {
    /// Serial port of the controller. Without it the ports of the platform
    /// naming scheme are scanned.
    #[arg(short, long, env = "IGUS_PORT", global = true)]
    pub port: Option<String>,

    #[arg(short, long, default_value_t = 115_200, global = true)]
    pub baud: u32,

    /// Joint configuration file.
    #[arg(short, long, env = "IGUS_JOINTS", default_value = "joints.toml", global = true)]
    pub joints: PathBuf,

    /// Speed limit in percent of the servo maximum.
    #[arg(short, long, default_value_t = 100, global = true, value_parser = clap::value_parser!(i32).range(1..=100))]
    pub speed: i32,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream a keyframe file through the host side player.
    Play {
        file: PathBuf,
        #[arg(long = "loop")]
        looped: bool,
        /// Print the interpolated pose stream without a robot.
        #[arg(long)]
        dry_run: bool,
    },
    /// Transfer a keyframe file to the controller.
    Upload {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = Action::Play)]
        action: Action,
    },
    /// Live view of the robot state.
    Monitor,
    /// Switch the motor currents.
    Compliance {
        #[arg(value_enum)]
        mode: Compliance,
    },
    /// Find the protocol version of a controller and send it to its bootloader.
    ProbeReset {
        #[arg(value_name = "PORT")]
        device: String,
    },
    /// Validate a joint configuration and optionally a keyframe file offline.
    Check {
        #[arg(value_name = "JOINTS")]
        config: PathBuf,
        file: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Action {
    Commit,
    Play,
    Loop,
}

impl From<Action> for KeyframeCommand {
    fn from(action: Action) -> Self {
        match action {
            Action::Commit => KeyframeCommand::Commit,
            Action::Play => KeyframeCommand::Play,
            Action::Loop => KeyframeCommand::Loop,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Compliance {
    Stiff,
    Hardware,
}

impl From<Compliance> for ComplianceMode {
    fn from(mode: Compliance) -> Self {
        match mode {
            Compliance::Stiff => ComplianceMode::Stiff,
            Compliance::Hardware => ComplianceMode::Hardware,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // The monitor owns the terminal, log lines would tear it.
    if !matches!(cli.command, Commands::Monitor) {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Play { file, looped, dry_run } => {
            let frames = load_keyframes(&file)?;
            let session = if dry_run { None } else { Some(Session::open(&cli.connection)?) };
            play::play(session, &frames, looped, cli.connection.speed).await
        }
        Commands::Upload { file, action } => {
            let frames = load_keyframes(&file)?;
            let session = Session::open(&cli.connection)?;
            play::upload(session, &frames, action.into(), cli.connection.speed).await
        }
        Commands::Monitor => {
            let session = Session::open(&cli.connection)?;
            monitor::run(session).await
        }
        Commands::Compliance { mode } => {
            let mut session = Session::open(&cli.connection)?;
            let result = session.change_compliance(mode.into()).await;
            session.close().await;
            Ok(result?)
        }
        Commands::ProbeReset { device } => probe::probe_reset(&device, cli.connection.baud),
        Commands::Check { config, file } => check(&config, file.as_deref(), cli.connection.speed),
    }
}

/// Offline validation. Prints what the controller would receive.
fn check(joints: &Path, file: Option<&Path>, speed: i32) -> Result<(), Box<dyn Error>> {
    let table = JointTable::load(joints)?;
    let axes = table.check_axis_count()?;
    println!("{} joints on {} axes, lookahead {} ms", table.len(), axes, table.lookahead);
    for joint in table.iter() {
        println!(
            "  #{} {:<12} [{:+.3}, {:+.3}] rad, enc_to_mot {}, currents {}/{}",
            joint.address,
            joint.name,
            joint.lower_limit,
            joint.upper_limit,
            joint.enc_to_mot(),
            joint.max_current,
            joint.hold_current
        );
    }

    let Some(file) = file else {
        return Ok(());
    };
    let frames = load_keyframes(file)?;
    for (i, frame) in frames.iter().enumerate() {
        for name in frame.angles.keys() {
            if table.get(name).is_none() {
                println!("  warning: keyframe {} moves unknown joint {}", i, name);
            }
        }
    }
    let speed_limit = 0.01 * speed as f64 * SERVO_SPEED_MAX;
    let timeline = Timeline::build(&frames, speed_limit, false).ok_or("A sequence needs at least two keyframes")?;
    let records = timeline.to_records(&table)?;
    println!(
        "{} keyframes, {} controller frames, {:.2} s at {}% speed",
        frames.len(),
        records.len(),
        timeline.total_duration(),
        speed
    );
    for (i, record) in records.iter().enumerate() {
        println!("  {:3}: {:5} ms output {} ticks {:?}", i, record.duration, record.output_command, &record.ticks[..axes]);
    }
    Ok(())
}
