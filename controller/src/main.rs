use std::io::{BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use controller::simulated::{spawn_ticker, SimTime, SimulatedAxes, SimulatedBoard};
use controller::{Clock, ComBuffer, Controller, ControllerError, FileEeprom};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Runs the controller firmware on simulated axes behind a serial port.
#[derive(Parser, Debug)]
#[command(name = "controller", version, about)]
struct Args {
    /// Serial port the PC talks to, e.g. one end of a pty pair.
    #[arg(short, long)]
    port: String,

    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Number of simulated axis controllers.
    #[arg(long, default_value_t = 4)]
    axes: usize,

    /// Encoder ticks per motor step.
    #[arg(long, default_value_t = 1.0)]
    encoder_ratio: f64,

    /// Duration of the simulated reference search.
    #[arg(long, default_value_t = 300)]
    search_ms: u64,

    /// File holding the EEPROM image.
    #[arg(long, default_value = "controller.eeprom")]
    eeprom: PathBuf,
}

fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let port = serialport::new(&args.port, args.baud).timeout(Duration::from_millis(10)).open()?;
    let mut reader = port.try_clone()?;
    let mut writer = port;
    info!("Listening on {} at {} baud", args.port, args.baud);

    let to_bot = Arc::new(ComBuffer::new());
    let to_pc = Arc::new(ComBuffer::new());
    let clock = Arc::new(Clock::new());
    let running = Arc::new(AtomicBool::new(true));

    let ticker = spawn_ticker(clock.clone(), running.clone());

    let rx = {
        let to_bot = to_bot.clone();
        let running = running.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            while running.load(Ordering::SeqCst) {
                match reader.read(&mut buf) {
                    Ok(n) => to_bot.put_data(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        error!("Serial read failed: {}", e);
                        running.store(false, Ordering::SeqCst);
                    }
                }
            }
        })
    };

    let tx = {
        let to_pc = to_pc.clone();
        let running = running.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            while running.load(Ordering::SeqCst) {
                let n = to_pc.get_into(&mut buf);
                if n == 0 {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                if let Err(e) = writer.write_all(&buf[..n]) {
                    error!("Serial write failed: {}", e);
                    running.store(false, Ordering::SeqCst);
                }
            }
        })
    };

    let time = SimTime::realtime(clock.clone());
    let axes = SimulatedAxes::new(args.axes, time.clone())
        .with_encoder_ratio(args.encoder_ratio)
        .with_search_time(args.search_ms);
    let board = SimulatedBoard::new(time);

    // every line on stdin presses the start button
    let button = board.button_handle();
    thread::spawn(move || {
        for _ in std::io::stdin().lock().lines() {
            info!("Button pressed");
            button.press();
        }
    });

    let eeprom = FileEeprom::open(&args.eeprom)?;
    let mut controller = Controller::new(board, axes, eeprom, clock, to_bot, to_pc);
    controller.boot();

    let keep_running = running.clone();
    controller.run(move || keep_running.load(Ordering::SeqCst));

    running.store(false, Ordering::SeqCst);
    let _ = rx.join();
    let _ = tx.join();
    let _ = ticker.join();
    Ok(())
}
