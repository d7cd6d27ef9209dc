use std::fs::File;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use log::{error, warn};

use dkt032_rs::{logging, ActuatorKind, CorrectedSample, LinkConfig, Session};

#[derive(Parser, Debug)]
#[command(
    name = "dkt032",
    about = "Connect to the IT03.2 convection tower, stream corrected readings, drive fan and heater"
)]
struct Args {
    /// Serial port to use (e.g. /dev/ttyACM0 or COM3); skips auto-discovery
    #[arg(long)]
    port: Option<String>,
    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,
    /// Append corrected readings to this CSV file
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Skip the startup calibration pass (readings stay uncorrected)
    #[arg(long)]
    no_calibrate: bool,
}

fn main() {
    logging::init();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    if args.list_ports {
        return list_ports();
    }

    let mut session = Session::new(LinkConfig::default());
    let port = session
        .connect(args.port.as_deref())
        .context("no tower found; pass --port if you know the device path")?;
    println!("Connected on {port}");

    if args.no_calibrate {
        println!("Calibration skipped; readings are uncorrected.");
    } else {
        println!("Calibrating, keep the tower at rest...");
        let cal = session.calibrate().context("calibration failed")?;
        if cal.samples_used == 0 {
            warn!("calibration received no data; offsets remain zero");
        } else {
            println!("Calibrated over {} samples.", cal.samples_used);
        }
    }

    let receiver = session.start().context("failed to start acquisition")?;
    let csv = args
        .csv
        .as_deref()
        .map(CsvLogger::create)
        .transpose()
        .context("cannot open CSV log")?;
    let printer = thread::spawn(move || print_stream(receiver, csv));

    println!("Streaming. Commands: fan <0-255>, heat <0-255>, quit");
    command_loop(&session)?;

    session.disconnect()?;
    let _ = printer.join();
    println!("Done.");
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("cannot enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{}", port.port_name);
    }
    Ok(())
}

fn command_loop(session: &Session) -> Result<()> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "quit" | "exit") {
            break;
        }
        match parse_command(input) {
            Ok((kind, value)) => {
                if let Err(e) = session.set_actuator(kind, value) {
                    error!("command failed: {e}");
                }
            }
            Err(msg) => println!("{msg}"),
        }
    }
    Ok(())
}

fn parse_command(input: &str) -> std::result::Result<(ActuatorKind, i32), String> {
    const USAGE: &str = "commands: fan <0-255>, heat <0-255>, quit";
    let mut parts = input.split_whitespace();
    let kind = parts
        .next()
        .and_then(|word| word.parse::<ActuatorKind>().ok())
        .ok_or(USAGE.to_string())?;
    let value = parts
        .next()
        .ok_or_else(|| format!("usage: {} <0-255>", kind.as_str().to_lowercase()))?
        .parse::<i32>()
        .map_err(|_| format!("{} takes a number between 0 and 255", kind.as_str()))?;
    Ok((kind, value))
}

fn print_stream(receiver: Receiver<CorrectedSample>, mut csv: Option<CsvLogger>) {
    for record in receiver.iter() {
        let s = record.sample;
        println!(
            "[{}] TE={:6.2} °C | TS={:6.2} °C | TC={:6.2} °C | Vel={:5.2} m/s | P={:7.2} W",
            Local::now().format("%H:%M:%S"),
            s.inlet_temp,
            s.outlet_temp,
            s.thermocouple_temp,
            s.air_velocity,
            s.power
        );
        let mut csv_failed = false;
        if let Some(logger) = csv.as_mut() {
            if let Err(e) = logger.append(&record) {
                error!("csv write failed, disabling log: {e}");
                csv_failed = true;
            }
        }
        if csv_failed {
            csv = None;
        }
    }
}

/// Tabular export: one row per published sample, wall-clock stamped.
struct CsvLogger {
    writer: csv::Writer<File>,
    last_flush: Instant,
}

impl CsvLogger {
    fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record([
            "date",
            "time",
            "inlet_c",
            "outlet_c",
            "thermocouple_c",
            "velocity_ms",
            "power_w",
        ])?;
        Ok(Self {
            writer,
            last_flush: Instant::now(),
        })
    }

    fn append(&mut self, record: &CorrectedSample) -> Result<()> {
        let now = Local::now();
        let s = record.sample;
        self.writer.write_record([
            now.format("%Y-%m-%d").to_string(),
            now.format("%H:%M:%S").to_string(),
            format!("{:.2}", s.inlet_temp),
            format!("{:.2}", s.outlet_temp),
            format!("{:.2}", s.thermocouple_temp),
            format!("{:.2}", s.air_velocity),
            format!("{:.2}", s.power),
        ])?;
        if self.last_flush.elapsed() > Duration::from_secs(1) {
            self.writer.flush()?;
            self.last_flush = Instant::now();
        }
        Ok(())
    }
}
