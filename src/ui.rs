// Terminal output helpers for command summaries

use colored::Colorize;

pub fn print_header(title: &str) {
    let rule = "─".repeat(title.chars().count() + 4);
    println!();
    println!("{}", rule.bright_blue());
    println!("{}", format!("  {}", title).bright_blue().bold());
    println!("{}", rule.bright_blue());
}

pub fn print_success(message: &str) {
    println!("{}", format!("✅ {}", message).bright_green().bold());
}

pub fn print_error(message: &str) {
    eprintln!("{}", format!("❌ {}", message).bright_red().bold());
}

pub fn print_info(message: &str) {
    println!("{}", format!("ℹ️  {}", message).bright_cyan());
}

pub fn print_warning(message: &str) {
    println!("{}", format!("⚠️  {}", message).bright_yellow());
}

/// Aligned `key  value` rows
pub fn print_rows<K: AsRef<str>, V: AsRef<str>>(rows: &[(K, V)]) {
    let width = rows
        .iter()
        .map(|(k, _)| k.as_ref().chars().count())
        .max()
        .unwrap_or(0);
    for (key, value) in rows {
        let padded = format!("{:<width$}", key.as_ref());
        println!("  {}  {}", padded.bold(), value.as_ref());
    }
}
