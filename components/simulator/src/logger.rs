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

//! Console logger that splits parseable session events out of the stream

use log::{Level, Log, Metadata, Record, SetLoggerError};
use std::sync::Mutex;

use session_event_writer::{SessionEventFileWriter, EVENT_INDICATOR_CHAR};

const COLOR_RESET: &str = "\x1B[0m";

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1B[1;31m",
        Level::Warn => "\x1B[1;33m",
        Level::Info => "\x1B[1;32m",
        Level::Debug => "\x1B[1;34m",
        Level::Trace => "",
    }
}

pub struct SimLogger {
    max_level: Level,
    events: Option<Mutex<SessionEventFileWriter>>,
}

impl Log for SimLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let msg = record.args().to_string();

        if msg.starts_with(EVENT_INDICATOR_CHAR) {
            if let Some(events) = &self.events {
                events.lock().unwrap().write_line(&msg);
            }
        }

        println!(
            "{}{:<5}{} [{}] {}",
            level_color(record.level()),
            record.level(),
            COLOR_RESET,
            record.target(),
            msg
        );
    }

    fn flush(&self) {
        if let Some(events) = &self.events {
            events.lock().unwrap().flush();
        }
    }
}

pub fn init(max_level: Level, event_file_path: Option<&str>) -> Result<(), SetLoggerError> {
    let events = event_file_path.and_then(|path| match SessionEventFileWriter::create(path) {
        Ok(writer) => Some(Mutex::new(writer)),
        Err(err) => {
            // the event file is a nice-to-have; the run goes on without it
            eprintln!("could not create event file {}: {}", path, err);
            None
        }
    });
    log::set_logger(Box::leak(Box::new(SimLogger { max_level, events })))?;
    log::set_max_level(max_level.to_level_filter());
    Ok(())
}
