//  _____       ______   ____
// |_   _|     |  ____|/ ____|  Institute of Embedded Systems
//   | |  _ __ | |__  | (___    Zurich University of Applied Sciences
//   | | | '_ \|  __|  \___ \   8401 Winterthur, Switzerland
//  _| |_| | | | |____ ____) |
// |_____|_| |_|______|_____/
//
// Copyright 2025 Institute of Embedded Systems at Zurich University of Applied Sciences.
// All rights reserved.
// SPDX-License-Identifier: MIT

//! Extracts coordination-session events from the log stream into a CSV
//! file for offline analysis (antiphase error plots, offset convergence).

use std::{
    fs::File,
    io::{self, Write},
};

/// First character of an event-log line (`$uptime;mac;kind;content`)
pub const EVENT_INDICATOR_CHAR: char = '$';

const FILE_HEADER: &str = "uptime_us;mac;kind;content";

/// One event emitted by a device's event-log macros
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Device-local microseconds
    pub uptime_us: u64,
    /// Link-layer address of the emitting device
    pub mac: u64,
    /// Event class: `state`, `role`, `mode`, `message`, ...
    pub kind: String,
    /// JSON object or quoted scalar, kept as written
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventParseError {
    MissingIndicator,
    MissingField(&'static str),
    BadUptime,
    BadMac,
}

impl SessionEvent {
    /// Parse one `$`-prefixed log line
    pub fn parse(line: &str) -> Result<SessionEvent, EventParseError> {
        let line = line
            .strip_prefix(EVENT_INDICATOR_CHAR)
            .ok_or(EventParseError::MissingIndicator)?;
        // content is free form and may contain separators itself
        let mut fields = line.splitn(4, ';');
        let uptime_us = fields
            .next()
            .ok_or(EventParseError::MissingField("uptime"))?
            .parse()
            .map_err(|_| EventParseError::BadUptime)?;
        let mac = fields.next().ok_or(EventParseError::MissingField("mac"))?;
        let mac = u64::from_str_radix(mac, 16).map_err(|_| EventParseError::BadMac)?;
        let kind = fields
            .next()
            .ok_or(EventParseError::MissingField("kind"))?
            .to_string();
        let content = fields.next().unwrap_or("").to_string();
        Ok(SessionEvent {
            uptime_us,
            mac,
            kind,
            content,
        })
    }
}

/// Appends parsed session events to a CSV file
///
/// Lines that fail to parse are counted and skipped; the log stream mixes
/// events with free-form messages and the file must stay machine readable.
pub struct SessionEventFileWriter {
    file: File,
    events_written: u64,
    parse_failures: u64,
}

impl SessionEventFileWriter {
    pub fn create(output_file_path: &str) -> io::Result<Self> {
        let mut file = File::create(output_file_path)?;
        writeln!(file, "{}", FILE_HEADER)?;
        Ok(Self {
            file,
            events_written: 0,
            parse_failures: 0,
        })
    }

    /// Parse one log line and append it in normalized form
    pub fn write_line(&mut self, line: &str) {
        match SessionEvent::parse(line) {
            Ok(event) => {
                // MACs re-padded to full width so the column diffs cleanly
                let written = writeln!(
                    self.file,
                    "{};{:012x};{};{}",
                    event.uptime_us, event.mac, event.kind, event.content
                );
                if written.is_ok() {
                    self.events_written += 1;
                }
            }
            Err(_) => self.parse_failures += 1,
        }
    }

    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    pub fn flush(&mut self) {
        let _ = self.file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("session_events_{}_{}.csv", name, std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn parses_event_lines() {
        let event = SessionEvent::parse("$1500000;c44f33100001;state;\"Inactive\"").unwrap();
        assert_eq!(event.uptime_us, 1_500_000);
        assert_eq!(event.mac, 0xc44f_3310_0001);
        assert_eq!(event.kind, "state");
        assert_eq!(event.content, "\"Inactive\"");

        // content keeps its own separators
        let event =
            SessionEvent::parse("$2;1;mode;{\"mode\":\"M1\";\"cycle_ms\":1000}").unwrap();
        assert_eq!(event.content, "{\"mode\":\"M1\";\"cycle_ms\":1000}");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(
            SessionEvent::parse("no indicator"),
            Err(EventParseError::MissingIndicator)
        );
        assert_eq!(
            SessionEvent::parse("$abc;1;state;x"),
            Err(EventParseError::BadUptime)
        );
        assert_eq!(
            SessionEvent::parse("$1;zz-zz;state;x"),
            Err(EventParseError::BadMac)
        );
        assert_eq!(
            SessionEvent::parse("$1;1"),
            Err(EventParseError::MissingField("kind"))
        );
    }

    #[test]
    fn writer_keeps_the_file_machine_readable() {
        let path = temp_path("writer");
        let mut writer = SessionEventFileWriter::create(&path).unwrap();
        writer.write_line("$1000;a1;boot;80");
        writer.write_line("just a log message");
        writer.write_line("$2000;a1;state;\"PairingWait\"");
        writer.flush();
        assert_eq!(writer.events_written(), 2);
        assert_eq!(writer.parse_failures(), 1);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "uptime_us;mac;kind;content");
        assert_eq!(lines[1], "1000;0000000000a1;boot;80");
        assert_eq!(lines[2], "2000;0000000000a1;state;\"PairingWait\"");
        let _ = std::fs::remove_file(&path);
    }
}
