//! Dumps CAN bus traffic read from a `canrm-daemon` device node to stdout
//! and, optionally, a log file.

mod filter;

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;

use canrm_core::wire::{self, OpenFlags};
use canrm_core::{EFF_MASK, SFF_MASK};

#[derive(Parser, Debug)]
#[command(name = "candump", version, about = "Dump CAN bus traffic.")]
struct Cli {
    /// Timestamp mode: (a)bsolute/(d)elta/(z)ero/(A)bsolute with date.
    #[arg(short = 't')]
    timestamp: Option<char>,

    /// Log nanosecond timestamps instead of microseconds.
    #[arg(short = 'N')]
    use_ns: bool,

    /// Enable additional ASCII output.
    #[arg(short = 'a')]
    ascii_view: bool,

    /// Silent mode: suppress console output.
    #[arg(short = 's')]
    silent: bool,

    /// Log frames to a file, defaulting its name to a timestamped one.
    #[arg(short = 'l')]
    log: bool,

    /// Log frames to the named file (implies `-l`). `-` disables file logging.
    #[arg(short = 'f')]
    logname: Option<String>,

    /// Terminate after receiving this many frames.
    #[arg(short = 'n')]
    count: Option<u32>,

    /// `<ifname>[,filter]*`
    target: String,
}

struct Timestamper {
    mode: Option<char>,
    use_ns: bool,
    start: Instant,
    last: Option<Instant>,
}

impl Timestamper {
    fn new(mode: Option<char>, use_ns: bool) -> Self {
        Timestamper { mode, use_ns, start: Instant::now(), last: None }
    }

    fn prefix(&mut self) -> Option<String> {
        let mode = self.mode?;
        let elapsed = match mode {
            'a' | 'A' => None,
            'd' => {
                let now = Instant::now();
                let delta = now.duration_since(self.last.unwrap_or(self.start));
                self.last = Some(now);
                Some(delta)
            }
            'z' => Some(Instant::now().duration_since(self.start)),
            _ => return None,
        };

        let text = match mode {
            'a' => {
                let now = time::OffsetDateTime::now_utc();
                let epoch = now.unix_timestamp();
                let nanos = now.nanosecond();
                format_seconds(epoch as u64, nanos, self.use_ns)
            }
            'A' => {
                let now = time::OffsetDateTime::now_utc();
                let format = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
                let date = now.format(&format).unwrap_or_default();
                let nanos = now.nanosecond();
                format!("{date}.{}", format_fraction(nanos, self.use_ns))
            }
            'd' | 'z' => {
                let delta = elapsed.unwrap_or_default();
                format_seconds(delta.as_secs(), delta.subsec_nanos(), self.use_ns)
            }
            _ => return None,
        };

        Some(text)
    }
}

fn format_seconds(secs: u64, nanos: u32, use_ns: bool) -> String {
    format!("{secs:010}.{}", format_fraction(nanos, use_ns))
}

fn format_fraction(nanos: u32, use_ns: bool) -> String {
    if use_ns {
        format!("{nanos:09}")
    } else {
        format!("{:06}", nanos / 1_000)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(mode) = cli.timestamp {
        if !matches!(mode, 'a' | 'A' | 'd' | 'z') {
            eprintln!("candump: unknown timestamp mode '{mode}' - ignored");
        }
    }
    let timestamp_mode = cli.timestamp.filter(|m| matches!(m, 'a' | 'A' | 'd' | 'z'));

    let (ifname, filters) = filter::parse_target(&cli.target);

    let log_to_file = cli.log || cli.logname.is_some();
    let disable_file_logging = cli.logname.as_deref() == Some("-");
    let mut log_file = if log_to_file && !disable_file_logging {
        let path = cli.logname.clone().map(PathBuf::from).unwrap_or_else(default_log_name);
        println!("Enabling Logfile '{}'", path.display());
        Some(File::create(&path).with_context(|| format!("opening log file {}", path.display()))?)
    } else {
        None
    };
    let silent = cli.silent || (log_to_file && !disable_file_logging);

    let device_path = PathBuf::from("/dev").join(&ifname);
    let mut stream = std::os::unix::net::UnixStream::connect(&device_path)
        .with_context(|| format!("open {ifname} controller error"))?;
    wire::write_handshake(&mut stream, OpenFlags::APPEND)?;

    let mut timestamper = Timestamper::new(timestamp_mode, cli.use_ns);
    let mut remaining = cli.count;

    loop {
        wire::write_request(&mut stream, wire::opcode::READ, &[])?;
        let (status, payload) = wire::read_reply(&mut stream)?;
        if status < 0 {
            bail!("read error");
        }

        let Some(frame) = wire::decode_frame(&payload) else {
            continue;
        };

        if !filter::passes(&filters, frame.can_id) {
            continue;
        }

        let mut line = String::new();
        if let Some(prefix) = timestamper.prefix() {
            line.push_str(&format!("{prefix} "));
        }
        line.push_str(&ifname);

        let id = frame.can_id & if frame.is_eff() { EFF_MASK } else { SFF_MASK };
        line.push_str(&format!("{id:>10x}{:>3} ", frame.len));

        for i in 0..8usize {
            if (frame.len as usize) <= i {
                line.push_str("   ");
            } else {
                line.push_str(&format!(" {:02x}", frame.data[i]));
            }
        }

        if cli.ascii_view {
            line.push_str("  ");
            for &byte in &frame.data[..frame.len as usize] {
                if byte > 31 && byte != 127 {
                    line.push(byte as char);
                } else {
                    line.push('.');
                }
            }
        }

        if !silent {
            println!("{line}");
        }
        if let Some(file) = log_file.as_mut() {
            writeln!(file, "{line}")?;
        }

        if let Some(count) = remaining.as_mut() {
            *count -= 1;
            if *count == 0 {
                break;
            }
        }
    }

    Ok(())
}

fn default_log_name() -> PathBuf {
    let now = time::OffsetDateTime::now_utc();
    let format = time::macros::format_description!("[year]-[month]-[day]_[hour][minute][second]");
    let stamp = now.format(&format).unwrap_or_else(|_| "0".to_string());
    PathBuf::from(format!("candump-{stamp}.log"))
}
