// Screenshot example
//
// This example grabs the scope display as a PNG and writes it to disk.

use clap::Parser;
use dhoscope_rs::{
    Connection, ConnectionSettings, Oscilloscope, ScopeConfig, SerialConnection, TcpConnection,
};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "screenshot")]
#[command(version = "1.0")]
#[command(about = "Save the display of a DHO900 oscilloscope as PNG")]
struct Args {
    /// Host name or IP address of the scope (raw SCPI port 5555)
    #[arg(long, conflicts_with = "serial", required_unless_present = "serial")]
    host: Option<String>,

    /// Serial port the scope is attached to
    #[arg(long)]
    serial: Option<String>,

    #[arg(long, default_value_t = 115_200, help = "Serial baud rate")]
    baud: u32,

    #[arg(short, long, default_value = "screenshot.png")]
    output: String,

    /// Seconds to wait for the image to stream in
    #[arg(short, long, default_value_t = 17)]
    timeout: u64,

    /// Save the raw bytes even when no PNG signature was found
    #[arg(long)]
    keep_raw: bool,

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
        (Some(host), _) => screenshot(TcpConnection::connect_host(host, settings)?, &args),
        (None, Some(port)) => screenshot(SerialConnection::open(port, args.baud, settings)?, &args),
        (None, None) => Err("either --host or --serial is required".into()),
    }
}

fn screenshot<C: Connection>(conn: C, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ScopeConfig {
        screenshot_timeout: Duration::from_secs(args.timeout),
        ..ScopeConfig::default()
    };
    let mut scope = Oscilloscope::open(conn, config)?;
    println!("Connected to: {}", scope.identity());

    let start = Instant::now();
    let image = match scope.take_screenshot() {
        Ok(image) => image,
        Err(e) => {
            if let Ok(queue) = scope.last_error() {
                eprintln!("Scope error queue: {}", queue);
            }
            return Err(e.into());
        }
    };
    println!(
        "Captured {} bytes in {} chunks ({:.1}s)",
        image.data.len(),
        image.chunks_read,
        start.elapsed().as_secs_f64()
    );

    let data = if args.keep_raw {
        if !image.signature_found {
            println!("Warning: no PNG signature, saving raw capture");
        }
        image.data
    } else {
        image.require_signature()?
    };

    std::fs::write(&args.output, &data)?;
    println!("Saved {}", args.output);
    Ok(())
}
