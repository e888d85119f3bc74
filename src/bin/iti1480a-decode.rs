use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;

use iti1480a::time::{short_tic_to_time, tic_to_time};
use iti1480a::token::{data_fields, sof_fields, split_fields, token_fields};
use iti1480a::{
    Decoder, Message, MessageSink, Status, Tic, Token, TokenKind, Transaction, Transfer,
};

const CHUNK_SIZE: usize = 16 * 1024;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Decodes an ITI1480A USB analyzer capture stream into bus events, packets, transactions and endpoint-zero control transfers. Reads the output of iti1480a-capture, live or from a file."
)]
struct Opt {
    /// Capture source ("-" for stdin).
    #[structopt(short = "i", long = "infile", default_value = "-")]
    infile: String,

    /// Decoded output destination ("-" for stdout).
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
    let output: Box<dyn Write> = if opt.outfile == "-" {
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

    let mut decoder = Decoder::new(HumanReadable::new(output, opt.verbose - opt.quiet));
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
        match decoder.push(&buffer[..n]) {
            Ok(Status::Running) => {}
            Ok(Status::Done) => {
                decoder.stop();
                return seal(decoder);
            }
            Err(error) => {
                eprintln!("{}", error);
                return Ok(1);
            }
        }
        if let Some(code) = check_output(&mut decoder)? {
            return Ok(code);
        }
    }
    match decoder.finish() {
        Ok(()) => seal(decoder),
        Err(error) => {
            eprintln!("{}", error);
            Ok(1)
        }
    }
}

/// Flushes the renderer and maps its stored I/O outcome to an exit
/// code. A broken pipe on output is a clean exit.
fn seal(mut decoder: Decoder<HumanReadable<Box<dyn Write>>>) -> Result<i32> {
    decoder.sink_mut().finish();
    match decoder.into_sink().take_error() {
        None => Ok(0),
        Some(ref error) if error.kind() == ErrorKind::BrokenPipe => Ok(0),
        Some(error) => Err(error).context("failed to write decoded output"),
    }
}

fn check_output(decoder: &mut Decoder<HumanReadable<Box<dyn Write>>>) -> Result<Option<i32>> {
    match decoder.sink_mut().take_error() {
        None => Ok(None),
        Some(ref error) if error.kind() == ErrorKind::BrokenPipe => Ok(Some(0)),
        Some(error) => Err(error).context("failed to write decoded output"),
    }
}

/// Renders pipeline messages as text lines.
///
/// Consecutive start-of-frame transactions collapse into one
/// `Start of frame a -> b (n)` line unless verbosity asks for each.
struct HumanReadable<W: Write> {
    out: W,
    level: i32,
    sof_first: Option<(Tic, u16)>,
    sof_last: Option<u16>,
    sof_count: u32,
    error: Option<io::Error>,
}

impl<W: Write> HumanReadable<W> {
    fn new(out: W, level: i32) -> HumanReadable<W> {
        HumanReadable {
            out,
            level,
            sof_first: None,
            sof_last: None,
            sof_count: 0,
            error: None,
        }
    }

    fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }

    /// Flushes held-back state at end of run.
    fn finish(&mut self) {
        if self.error.is_some() {
            return;
        }
        if let Err(error) = self.flush_sof().and_then(|_| self.out.flush()) {
            self.error = Some(error);
        }
    }

    fn render(&mut self, tic: Tic, message: Message) -> io::Result<()> {
        if self.level < 1 {
            if let Message::Transaction(ref transaction) = message {
                if let Some(frame) = sof_frame(transaction) {
                    match self.sof_first {
                        None => self.sof_first = Some((tic, frame)),
                        Some(_) => self.sof_last = Some(frame),
                    }
                    self.sof_count += 1;
                    return Ok(());
                }
            }
        }
        self.flush_sof()?;
        match message {
            Message::Raw(label) => {
                if self.level >= 0 {
                    writeln!(self.out, "{} {}", tic_to_time(tic), label)?;
                }
            }
            Message::Reset { duration } => writeln!(
                self.out,
                "{} Device reset ({})",
                tic_to_time(tic),
                short_tic_to_time(duration),
            )?,
            Message::FsToChirp { duration } => writeln!(
                self.out,
                "{} FS to chirp ({})",
                tic_to_time(tic),
                short_tic_to_time(duration),
            )?,
            Message::LsEop { duration } => writeln!(
                self.out,
                "{} LS EOP ({})",
                tic_to_time(tic),
                short_tic_to_time(duration),
            )?,
            Message::FsEop { duration } => writeln!(
                self.out,
                "{} FS EOP ({})",
                tic_to_time(tic),
                short_tic_to_time(duration),
            )?,
            Message::Transaction(transaction) => {
                let line = transaction
                    .tokens
                    .iter()
                    .map(|token| describe_token(token, self.level))
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(self.out, "{} {}", tic_to_time(tic), line)?;
            }
            Message::Transfer(transfer) => {
                writeln!(
                    self.out,
                    "{} {}",
                    tic_to_time(tic),
                    describe_transfer(&transfer),
                )?;
            }
            Message::Incomplete(tokens) => {
                let kinds = tokens
                    .iter()
                    .map(|token| token.kind.name())
                    .collect::<Vec<_>>()
                    .join(" ");
                writeln!(
                    self.out,
                    "{} Short transaction: {}",
                    tic_to_time(tic),
                    kinds,
                )?;
            }
            Message::TransactionError(label) | Message::TransferError(label) => {
                writeln!(self.out, "{} {}", tic_to_time(tic), label)?;
            }
        }
        Ok(())
    }

    fn flush_sof(&mut self) -> io::Result<()> {
        if let Some((tic, first)) = self.sof_first.take() {
            match self.sof_last.take() {
                None => writeln!(
                    self.out,
                    "{} Start of frame {}",
                    tic_to_time(tic),
                    first,
                )?,
                Some(last) => writeln!(
                    self.out,
                    "{} Start of frame {} -> {} ({})",
                    tic_to_time(tic),
                    first,
                    last,
                    self.sof_count,
                )?,
            }
            self.sof_count = 0;
        }
        Ok(())
    }
}

impl<W: Write> MessageSink for HumanReadable<W> {
    fn message(&mut self, tic: Tic, message: Message) {
        if self.error.is_some() {
            return;
        }
        if let Err(error) = self.render(tic, message) {
            self.error = Some(error);
        }
    }
}

fn sof_frame(transaction: &Transaction) -> Option<u16> {
    match transaction.tokens.as_slice() {
        [token] if token.kind == TokenKind::Sof => {
            sof_fields(token.packet.octets()).map(|fields| fields.frame)
        }
        _ => None,
    }
}

fn crc_marker(crc_error: bool) -> &'static str {
    if crc_error {
        " (crc error)"
    } else {
        ""
    }
}

fn describe_token(token: &Token, level: i32) -> String {
    let octets = token.packet.octets();
    match token.kind {
        TokenKind::In | TokenKind::Out | TokenKind::Setup | TokenKind::Ping => {
            match token_fields(octets) {
                Some(fields) => format!(
                    "{} dev {} ep {}{}",
                    token.kind,
                    fields.address,
                    fields.endpoint,
                    crc_marker(fields.crc_error),
                ),
                None => format!("{} {}", token.kind, token.packet.hex()),
            }
        }
        TokenKind::Sof => match sof_fields(octets) {
            Some(fields) => format!(
                "SOF {}{}",
                fields.frame,
                crc_marker(fields.crc_error),
            ),
            None => format!("SOF {}", token.packet.hex()),
        },
        TokenKind::SSplit | TokenKind::CSplit => match split_fields(octets) {
            Some(fields) => format!(
                "{} hub {} port {}{}",
                token.kind,
                fields.hub,
                fields.port,
                crc_marker(fields.crc_error),
            ),
            None => format!("{} {}", token.kind, token.packet.hex()),
        },
        kind if kind.is_data() => match data_fields(octets) {
            Some(fields) if level >= 1 => {
                let hex = fields
                    .data
                    .iter()
                    .map(|byte| format!("{:02x}", byte))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("{} [{}]{}", kind, hex, crc_marker(fields.crc_error))
            }
            Some(fields) => format!(
                "{} ({} bytes){}",
                kind,
                fields.data.len(),
                crc_marker(fields.crc_error),
            ),
            None => format!("{} {}", kind, token.packet.hex()),
        },
        kind => kind.name().to_string(),
    }
}

fn describe_transfer(transfer: &Transfer) -> String {
    let first = match transfer.transactions.first() {
        Some(transaction) => transaction,
        None => return "Control transfer".to_string(),
    };
    let address = first
        .lead_token()
        .and_then(Token::address)
        .map_or_else(|| "?".to_string(), |address| address.to_string());
    let read = first
        .tokens
        .iter()
        .find(|token| token.kind == TokenKind::Data0)
        .and_then(|token| token.packet.octets().get(1).copied())
        .map_or(false, |request_type| request_type & 0x80 != 0);
    let data_bytes: usize = transfer.transactions[1..]
        .iter()
        .filter_map(|transaction| {
            transaction
                .tokens
                .iter()
                .find(|token| token.kind.is_data())
                .and_then(|token| data_fields(token.packet.octets()))
                .map(|fields| fields.data.len())
        })
        .sum();
    let status = transfer
        .transactions
        .last()
        .and_then(|transaction| transaction.tokens.last())
        .map_or("?", |token| token.kind.name());
    format!(
        "Control {} dev {}: {} transactions, {} data bytes, {}",
        if read { "read" } else { "write" },
        address,
        transfer.transactions.len(),
        data_bytes,
        status,
    )
}
