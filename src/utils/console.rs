/// Operator-facing console narration
///
/// Every orchestration step prints a plain line before it runs and a
/// colored line after it finishes.

use colored::Colorize;

pub fn step(message: &str) {
    println!("{}", message);
}

pub fn success(message: &str) {
    println!("{}", message.green());
}

pub fn warn(message: &str) {
    println!("{}", format!("Warning: {}", message).yellow());
}

pub fn error(message: &str) {
    eprintln!("{}", format!("Error: {}", message).red());
}
