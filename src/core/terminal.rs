use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static KEY: Emoji<'_, '_> = Emoji("🔑 ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_secret(label: &str, secret: &str) {
    println!("  {} {}: {}", KEY, style(label).bold(), style(secret).cyan());
}

/// A titled block of `command  description` lines for help output.
pub struct GuideSection {
    title: &'static str,
    rows: Vec<(&'static str, &'static str)>,
}

impl GuideSection {
    pub fn new(title: &'static str) -> Self {
        Self {
            title,
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, usage: &'static str, description: &'static str) -> Self {
        self.rows.push((usage, description));
        self
    }

    pub fn print(&self) {
        println!("\n {}", style(self.title).bold().underlined());
        let width = self.rows.iter().map(|(u, _)| u.len()).max().unwrap_or(0);
        for (usage, description) in &self.rows {
            let padded = format!("{:<width$}", usage, width = width);
            println!("   {}  {}", style(padded).green(), style(description).dim());
        }
    }
}
