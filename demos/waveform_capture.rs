// Waveform capture example
//
// This example pulls the on-screen waveform of one channel, prints a few
// measurements and optionally writes the samples to a CSV file.

use clap::Parser;
use dhoscope_rs::{
    Channel, Connection, ConnectionSettings, Oscilloscope, SampleEncoding,
    ScopeConfig, SerialConnection, TcpConnection,
};
use polars::prelude::{CsvWriter, SerWriter};
use std::fs::File;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "waveform_capture")]
#[command(version = "1.0")]
#[command(about = "Capture a waveform from a DHO900 oscilloscope")]
struct Args {
    /// Host name or IP address of the scope (raw SCPI port 5555)
    #[arg(long, conflicts_with = "serial", required_unless_present = "serial")]
    host: Option<String>,

    /// Serial port the scope is attached to
    #[arg(long)]
    serial: Option<String>,

    #[arg(long, default_value_t = 115_200, help = "Serial baud rate")]
    baud: u32,

    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=4))]
    channel: u8,

    /// Transfer 16-bit samples instead of 8-bit
    #[arg(short, long)]
    word: bool,

    /// Limit the transfer to the first N points
    #[arg(short, long)]
    points: Option<u32>,

    /// Write time/voltage columns to this CSV file
    #[arg(short, long)]
    output: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let settings = ConnectionSettings::default();
    match (&args.host, &args.serial) {
        (Some(host), _) => capture(TcpConnection::connect_host(host, settings)?, &args),
        (None, Some(port)) => capture(SerialConnection::open(port, args.baud, settings)?, &args),
        (None, None) => Err("either --host or --serial is required".into()),
    }
}

fn capture<C: Connection>(conn: C, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut scope = Oscilloscope::open(conn, ScopeConfig::default())?;
    println!("Connected to: {}", scope.identity());

    let channel = Channel::new(args.channel)?;
    let encoding = if args.word {
        SampleEncoding::Word
    } else {
        SampleEncoding::Byte
    };

    let start = Instant::now();
    let capture = scope.fetch_waveform(channel, encoding, args.points)?;
    let elapsed = start.elapsed();

    let d = &capture.descriptor;
    println!(
        "{}: {} points in {:.1}ms ({:?}, {:?})",
        channel,
        capture.waveform.len(),
        elapsed.as_secs_f64() * 1000.0,
        d.sample_encoding,
        d.acquisition_type
    );
    println!(
        "  x: {:e} s/pt from {:e} s | y: {:e} V/code, origin {} V, reference {}",
        d.x_increment, d.x_origin, d.y_increment, d.y_origin, d.y_reference
    );

    let mut measurements = scope.voltage_measurements(channel);
    measurements.extend(scope.time_measurements(channel));
    for (item, value) in measurements {
        match value {
            Some(value) => println!("  {:<5} {}", item.as_str(), value),
            None => println!("  {:<5} unavailable", item.as_str()),
        }
    }

    let mut df = capture.waveform.to_dataframe()?;
    println!("{}", df.head(Some(5)));

    if let Some(path) = &args.output {
        let mut file = File::create(path)?;
        CsvWriter::new(&mut file).finish(&mut df)?;
        println!("Wrote {} rows to {}", df.height(), path);
    }

    Ok(())
}
