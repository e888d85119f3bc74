use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;

use iti1480a::packetiser::{describe_event, BusEvent};
use iti1480a::time::tic_to_time;
use iti1480a::{Framer, Record, RecordKind, RxCmd};

const CHUNK_SIZE: usize = 16 * 1024;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Dumps the raw record layer of an ITI1480A USB analyzer capture stream: bus events, data bytes and RxCmd status changes, without packet or transaction decoding."
)]
struct Opt {
    /// Capture source ("-" for stdin).
    #[structopt(short = "i", long = "infile", default_value = "-")]
    infile: String,

    /// Dump destination ("-" for stdout).
    #[structopt(short = "o", long = "outfile", default_value = "-")]
    outfile: String,

    /// Also write raw input to that file. Useful as tee(1) doesn't
    /// close its stdin when its stdout gets closed.
    #[structopt(short = "t", long = "tee")]
    tee: Option<PathBuf>,

    /// Keep waiting for more data when reaching EOF.
    #[structopt(short = "f", long = "follow")]
    follow: bool,

    /// Increase verbosity (may be repeated).
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: i32,

    /// Decrease verbosity (may be repeated).
    #[structopt(short = "q", parse(from_occurrences))]
    quiet: i32,
}

fn main() {
    match run(Opt::from_args()) {
        Ok(code) => process::exit(code),
        Err(error) => {
            eprintln!("{:#}", error);
            process::exit(2);
        }
    }
}

fn run(opt: Opt) -> Result<i32> {
    let mut input: Box<dyn Read> = if opt.infile == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(
            File::open(&opt.infile)
                .with_context(|| format!("failed to open {}", opt.infile))?,
        )
    };
    let mut output: Box<dyn Write> = if opt.outfile == "-" {
        Box::new(io::stdout())
    } else {
        Box::new(
            File::create(&opt.outfile)
                .with_context(|| format!("failed to create {}", opt.outfile))?,
        )
    };
    let mut tee = match &opt.tee {
        Some(path) => Some(
            File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => None,
    };

    let mut framer = Framer::new();
    let mut dump = RawDump::new(opt.verbose - opt.quiet);
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let n = match input.read(&mut buffer) {
            Ok(n) => n,
            Err(ref error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(error).context("failed to read capture input"),
        };
        if n == 0 {
            if opt.follow {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            break;
        }
        if let Some(tee) = tee.as_mut() {
            tee.write_all(&buffer[..n])
                .context("failed to write tee output")?;
        }
        for record in framer.feed(&buffer[..n]) {
            let record = match record {
                Ok(record) => record,
                Err(error) => {
                    eprintln!("{}", error);
                    return Ok(1);
                }
            };
            match dump.render(record, &mut output) {
                Ok(true) => {}
                // Terminal capture-stopped event: whatever trails it in
                // the stream is not ours to judge.
                Ok(false) => return flush_exit(&mut output),
                Err(ref error) if error.kind() == ErrorKind::BrokenPipe => return Ok(0),
                Err(error) => return Err(error).context("failed to write dump output"),
            }
        }
    }
    if let Err(error) = framer.finish() {
        eprintln!("{}", error);
        return Ok(1);
    }
    flush_exit(&mut output)
}

fn flush_exit(output: &mut impl Write) -> Result<i32> {
    match output.flush() {
        Ok(()) => Ok(0),
        Err(ref error) if error.kind() == ErrorKind::BrokenPipe => Ok(0),
        Err(error) => Err(error).context("failed to write dump output"),
    }
}

/// Record-by-record renderer. Repeated RxCmd values are printed once.
struct RawDump {
    level: i32,
    previous_rxcmd: Option<u8>,
}

impl RawDump {
    fn new(level: i32) -> RawDump {
        RawDump {
            level,
            previous_rxcmd: None,
        }
    }

    /// Renders one record; `Ok(false)` once the capture reported its
    /// own end.
    fn render(&mut self, record: Record, out: &mut impl Write) -> io::Result<bool> {
        match record.kind {
            RecordKind::Event => {
                let known = BusEvent::try_from(record.payload).is_ok();
                if known || self.level >= 1 {
                    writeln!(
                        out,
                        "{} Event {}",
                        tic_to_time(record.tic),
                        describe_event(record.payload),
                    )?;
                }
                // Both capture-stopped variants are terminal.
                Ok(record.payload & 0xf0 != 0xf0)
            }
            RecordKind::Data => {
                writeln!(
                    out,
                    "{} Data  {:#04x}",
                    tic_to_time(record.tic),
                    record.payload,
                )?;
                Ok(true)
            }
            RecordKind::RxCmd => {
                if self.previous_rxcmd != Some(record.payload) {
                    self.previous_rxcmd = Some(record.payload);
                    writeln!(
                        out,
                        "{} RxCmd {}",
                        tic_to_time(record.tic),
                        RxCmd(record.payload).describe(),
                    )?;
                }
                Ok(true)
            }
        }
    }
}
