//! Logging setup for the miner.
//!
//! Call [`init_journald_or_stdout`] once at startup. Everything else logs
//! through the macros re-exported by [`prelude`]:
//!
//! ```ignore
//! use crate::tracing::prelude::*;
//! info!(pool = %name, "Connected");
//! ```
//!
//! Under systemd, events go to the journal with their fields intact.
//! Otherwise they are written to stdout, one colored line per event with
//! structured fields on an indented second line.

use std::{env, fmt};

use time::macros::format_description;
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
        FmtContext, FormatEvent, FormatFields,
    },
    prelude::*,
    registry::LookupSpan,
};

#[cfg(target_os = "linux")]
use std::{io, os::unix::io::AsRawFd};

#[cfg(target_os = "linux")]
use nix::libc;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Target prefix of this crate's own events, dropped when printing.
const OWN_TARGET_PREFIX: &str = "stratum_miner::";

/// Width of the timestamp and level columns, used to indent field lines.
const FIELD_INDENT: &str = "               ";

/// Parse `JOURNAL_STREAM`'s `device:inode` form.
fn parse_journal_stream(value: &str) -> Option<(u64, u64)> {
    let (dev, ino) = value.split_once(':')?;
    Some((dev.parse().ok()?, ino.parse().ok()?))
}

/// Whether stderr is the stream systemd advertised in `JOURNAL_STREAM`.
///
/// Comparing device and inode catches the case where the variable was
/// inherited but stderr has since been redirected.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    let Some((dev, ino)) = env::var("JOURNAL_STREAM")
        .ok()
        .as_deref()
        .and_then(parse_journal_stream)
    else {
        return false;
    };

    let fd = io::stderr().as_raw_fd();
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    stat.st_dev == dev && stat.st_ino == ino
}

/// Install the journald subscriber under systemd, the stdout one otherwise.
pub fn init_journald_or_stdout() {
    #[cfg(target_os = "linux")]
    if stderr_is_journal_stream() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry().with(layer).init();
                return;
            }
            Err(e) => eprintln!("journald unavailable ({}), logging to stdout", e),
        }
    }

    use_stdout();
    debug!("Logging to stdout");
}

/// Stdout subscriber filtered by `RUST_LOG`, INFO when unset.
fn use_stdout() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .fmt_fields(DefaultFields::new())
                .event_format(MinerFormatter),
        )
        .init();
}

/// Shorten a target for display.
///
/// Our own modules lose the crate prefix; events bridged from `log` use the
/// target they carried; anything else is kept whole.
fn display_target(target: &str, log_target: Option<&str>) -> String {
    if let Some(own) = target.strip_prefix(OWN_TARGET_PREFIX) {
        own.to_string()
    } else if target == "log" {
        log_target.unwrap_or(target).to_string()
    } else {
        target.to_string()
    }
}

/// Render a field value without Debug quoting or `Some(..)` wrapping.
fn clean_value(debug: &str) -> &str {
    let unwrapped = debug
        .strip_prefix("Some(")
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(debug);
    unwrapped.trim_matches('"')
}

fn level_style(level: Level) -> (&'static str, &'static str) {
    match level {
        Level::ERROR => ("\x1b[31m", "ERROR"),
        Level::WARN => ("\x1b[33m", "WARN "),
        Level::INFO => ("\x1b[32m", "INFO "),
        Level::DEBUG => ("\x1b[34m", "DEBUG"),
        Level::TRACE => ("\x1b[35m", "TRACE"),
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl FieldCollector {
    fn log_target(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| *name == "log.target")
            .map(|(_, value)| clean_value(value))
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let text = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(text);
        } else {
            self.fields.push((field.name(), text));
        }
    }
}

/// Timestamp, level, short target and message, then fields in gray.
struct MinerFormatter;

impl<S, N> FormatEvent<S, N> for MinerFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        LocalTimer.format_time(&mut writer)?;
        let (color, label) = level_style(*event.metadata().level());
        write!(writer, " {}{}\x1b[0m ", color, label)?;

        let target = display_target(event.metadata().target(), collector.log_target());
        write!(writer, "{}: ", target)?;
        if let Some(message) = &collector.message {
            write!(writer, "{}", message.trim_matches('"'))?;
        }

        let mut shown = collector
            .fields
            .iter()
            .filter(|(name, _)| !name.starts_with("log."))
            .peekable();
        if shown.peek().is_some() {
            write!(writer, "\n\x1b[90m{}", FIELD_INDENT)?;
            for (i, (name, value)) in shown.enumerate() {
                let separator = if i == 0 { "" } else { ", " };
                write!(writer, "{}{}={}", separator, name, clean_value(value))?;
            }
            write!(writer, "\x1b[0m")?;
        }
        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let text = now
            .format(format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("8:1234", Some((8, 1234)); "valid")]
    #[test_case("8", None; "missing inode")]
    #[test_case("x:1", None; "bad device")]
    #[test_case("8:1:2", None; "extra part")]
    fn test_parse_journal_stream(value: &str, expected: Option<(u64, u64)>) {
        assert_eq!(parse_journal_stream(value), expected);
    }

    #[test_case("stratum_miner::pool::manager", None, "pool::manager"; "own module")]
    #[test_case("log", Some("mio::poll"), "mio::poll"; "bridged from log")]
    #[test_case("log", None, "log"; "bridged without target")]
    #[test_case("rustix::net", None, "rustix::net"; "dependency")]
    fn test_display_target(target: &str, log_target: Option<&str>, expected: &str) {
        assert_eq!(display_target(target, log_target), expected);
    }

    #[test_case("\"pool.example.com\"", "pool.example.com"; "quoted string")]
    #[test_case("Some(\"alice\")", "alice"; "some string")]
    #[test_case("Some(3)", "3"; "some number")]
    #[test_case("None", "None"; "none")]
    #[test_case("42", "42"; "number")]
    fn test_clean_value(debug: &str, expected: &str) {
        assert_eq!(clean_value(debug), expected);
    }
}
