use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use simplelog::LevelFilter;

use avrboot::{Flashing, Memory, Options, Protocol, transport::SerialTransport};

#[derive(Parser)]
#[command(
    name = "avrboot",
    version,
    about = "Flash AVR boards through their STK500 v1/v2 serial bootloader"
)]
struct Cli {
    /// Serial port of the board, auto-detected when omitted
    #[arg(short = 'p', long = "port")]
    port: Option<String>,

    /// Old bootloader (57600), Optiboot and Mega boards (115200)
    #[arg(short = 'b', long = "baudrate", default_value_t = 115200)]
    baudrate: u32,

    /// Nano/Uno: Stk500v1, Mega: Stk500v2
    #[arg(short = 'c', long = "protocol", value_enum)]
    protocol: Protocol,

    /// Operate on EEPROM instead of flash
    #[arg(short = 'e', long = "eeprom")]
    eeprom: bool,

    /// More output, repeat for wire traces
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Get info about the connected bootloader and CPU
    Info {},
    /// List serial ports
    List {},
    /// Write a firmware file, then verify it
    Flash {
        /// Intel HEX or raw binary
        path: String,
        /// Skip reading back after writing
        #[arg(long)]
        no_verify: bool,
    },
    /// Compare memory with a firmware file
    Verify { path: String },
    /// Save memory content to an Intel HEX file
    Read { path: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::List {} = cli.command {
        for port in SerialTransport::scan_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }

    let memory = if cli.eeprom {
        Memory::Eeprom
    } else {
        Memory::Flash
    };
    let mut flashing =
        Flashing::new_from_serial(cli.protocol, cli.port.as_deref(), cli.baudrate, &cli.options)
            .map_err(|e| {
                e.context(format!("could not connect with the board at {} baud", cli.baudrate))
            })?;
    flashing.dump_info()?;

    match execute(&mut flashing, &cli.command, memory) {
        Ok(()) => flashing.finish(),
        Err(e) => {
            flashing.abort();
            Err(e)
        }
    }
}

fn execute<T: avrboot::Transport>(
    flashing: &mut Flashing<T>,
    command: &Command,
    memory: Memory,
) -> Result<()> {
    match command {
        Command::Info {} | Command::List {} => {}
        Command::Flash { path, no_verify } => {
            let binary = avrboot::format::read_firmware_from_file(path)?;
            log::info!("Firmware size: {}", binary.len());
            flashing.flash(&binary, memory)?;
            if !no_verify {
                flashing.verify(&binary, memory)?;
            }
        }
        Command::Verify { path } => {
            let binary = avrboot::format::read_firmware_from_file(path)?;
            log::info!("Firmware size: {}", binary.len());
            flashing.verify(&binary, memory)?;
            log::info!("Verified!");
        }
        Command::Read { path } => {
            let data = flashing.read_memory(memory)?;
            avrboot::format::write_ihex_to_file(path, &data)?;
        }
    }
    Ok(())
}
