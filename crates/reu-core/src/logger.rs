//! Three-channel append-only logger shared by all pipeline components.
//!
//! Each call writes one ISO-8601 timestamped line to the channel's file and
//! mirrors the message to the console through `tracing`. An explicit
//! `ChannelLogger` instance is passed to components; there is no global
//! state beyond the `tracing` subscriber installed by the binary.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogChannel {
    General,
    Error,
    Scraper,
}

impl LogChannel {
    pub fn tag(self) -> &'static str {
        match self {
            LogChannel::General => "GENERAL",
            LogChannel::Error => "ERROR",
            LogChannel::Scraper => "SCRAPER",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            LogChannel::General => "general.log",
            LogChannel::Error => "error.log",
            LogChannel::Scraper => "scraper.log",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelLogger {
    dir: PathBuf,
}

impl ChannelLogger {
    /// Open a logger rooted at `dir`, creating the directory if absent.
    /// Idempotent: an existing directory and existing log files are reused.
    pub fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, channel: LogChannel) -> PathBuf {
        self.dir.join(channel.file_name())
    }

    pub fn general(&self, message: &str) {
        self.log(LogChannel::General, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogChannel::Error, message);
    }

    pub fn scraper(&self, message: &str) {
        self.log(LogChannel::Scraper, message);
    }

    /// Append one timestamped line to the channel file and mirror it to the
    /// console. Writes are synchronous and flushed per call; a failed file
    /// append is reported on the console but never panics the pipeline.
    pub fn log(&self, channel: LogChannel, message: &str) {
        match channel {
            LogChannel::Error => error!(target: "reu", "{message}"),
            LogChannel::Scraper => info!(target: "reu::scraper", "{message}"),
            LogChannel::General => info!(target: "reu", "{message}"),
        }

        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let line = format!("{stamp} [{}] {message}\n", channel.tag());
        if let Err(err) = self.append(channel, &line) {
            warn!(
                target: "reu",
                "failed to append to {}: {err}",
                self.path(channel).display()
            );
        }
    }

    fn append(&self, channel: LogChannel, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(channel))?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}
