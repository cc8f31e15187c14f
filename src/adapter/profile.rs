//! Adapter configuration profiles.
//!
//! A profile is the ordered list of AT commands that put an ELM327-class
//! device into a known state for one bus protocol. The protocol table
//! builds these; the driver only replays them and checks for `OK`.

use std::fmt;
use std::time::Duration;

/// Ordered AT command sequence. Order matters: echo and formatting first,
/// then protocol select, then timing.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterProfile {
    commands: Vec<String>,
}

impl AdapterProfile {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    pub fn push(&mut self, command: impl Into<String>) {
        self.commands.push(command.into());
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The base conditioning every profile starts with: echo off, linefeeds
    /// off, spaces off.
    pub fn conditioning() -> Self {
        let mut profile = Self::new();
        profile.push("ATE0");
        profile.push("ATL0");
        profile.push("ATS0");
        profile
    }
}

impl Default for AdapterProfile {
    fn default() -> Self {
        Self::conditioning()
    }
}

impl fmt::Display for AdapterProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.commands.join(" "))
    }
}

/// `ATSTxx` operand: units of 4 ms, clamped to one byte.
pub fn st_timeout_operand(timeout: Duration) -> u8 {
    (timeout.as_millis() / 4).clamp(1, 0xff) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditioning_order() {
        let profile = AdapterProfile::conditioning();
        let commands: Vec<_> = profile.commands().collect();
        assert_eq!(commands, ["ATE0", "ATL0", "ATS0"]);
    }

    #[test]
    fn st_operand_units() {
        assert_eq!(st_timeout_operand(Duration::from_millis(200)), 0x32);
        assert_eq!(st_timeout_operand(Duration::from_millis(2000)), 0xff);
        assert_eq!(st_timeout_operand(Duration::from_millis(0)), 0x01);
    }
}
