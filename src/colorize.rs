//! dmesg-style ANSI coloring for kernel log lines.
//!
//! Lines of the form `<L>[timestamp]message` are wrapped in the color for
//! kernel log level `L`; everything else passes through untouched.

use regex::Regex;
use std::sync::OnceLock;

pub const RESET: &str = "\x1b[0m";

/// ANSI color for a kernel log level (0 = EMERG .. 7 = DEBUG).
pub fn level_color(level: u8) -> &'static str {
    match level {
        0..=2 => "\x1b[1;31m",
        3 => "\x1b[0;31m",
        4 => "\x1b[0;33m",
        5 => "\x1b[0;34m",
        6 => "\x1b[0m",
        7 => "\x1b[0;30m",
        _ => RESET,
    }
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^<(\d)>\[(.*?)\](.*)$").expect("line pattern is valid")
    })
}

fn colorize_line(line: &str) -> String {
    let Some(caps) = line_pattern().captures(line) else {
        return line.to_string();
    };
    let level: u8 = caps[1].parse().unwrap_or(u8::MAX);
    format!(
        "{}<{}>[{}]{}{}",
        level_color(level),
        &caps[1],
        &caps[2],
        &caps[3],
        RESET
    )
}

/// Colorize every recognized line, preserving line terminators.
pub fn colorize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    for chunk in text.split_inclusive('\n') {
        let (line, terminator) = match chunk.strip_suffix("\r\n") {
            Some(line) => (line, "\r\n"),
            None => match chunk.strip_suffix('\n') {
                Some(line) => (line, "\n"),
                None => (chunk, ""),
            },
        };
        out.push_str(&colorize_line(line));
        out.push_str(terminator);
    }
    out
}
