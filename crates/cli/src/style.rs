//! Terminal styling for CLI output.

use console::Style;

/// Green check mark followed by the message.
pub fn success(msg: &str) -> String {
    format!("{} {}", Style::new().green().apply_to("✓"), msg)
}

/// Red cross followed by the message.
pub fn error(msg: &str) -> String {
    format!("{} {}", Style::new().red().apply_to("✗"), msg)
}

/// Yellow warning sign followed by the message.
pub fn warn(msg: &str) -> String {
    format!("{} {}", Style::new().yellow().apply_to("⚠"), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Provider availability marker for tables.
pub fn configured(yes: bool) -> String {
    if yes {
        format!("{} configured", Style::new().green().apply_to("●"))
    } else {
        format!("{} not configured", Style::new().dim().apply_to("○"))
    }
}
