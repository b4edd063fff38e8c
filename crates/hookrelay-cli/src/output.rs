//! Console output for hookrelay

use colored::{ColoredString, Colorize};
use hookrelay::RelayLogger;

/// Prints relay log lines, colored by what they report
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn new(no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self
    }

    /// Print an informational line outside the relay
    pub fn info(&self, msg: &str) {
        println!("{}", msg);
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }
}

impl RelayLogger for ConsoleLogger {
    fn log(&self, message: &str) {
        println!("{}", style(message));
    }
}

fn style(message: &str) -> ColoredString {
    if message.starts_with("Connected") || message.starts_with("Forwarding") {
        message.green()
    } else if message.starts_with("Failed") || message.contains("(not retried)") {
        message.red()
    } else if message.starts_with("Disconnected") || message.starts_with("Reconnecting") {
        message.yellow()
    } else {
        message.normal()
    }
}
