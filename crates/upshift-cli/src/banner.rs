use std::path::Path;

/// Print the startup banner with the store summary.
pub fn print_banner(database: &Path, current: u32, target: u32) {
    let version = env!("CARGO_PKG_VERSION");

    let db_display = match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => database.to_string_lossy().replace(&home, "~"),
        _ => database.to_string_lossy().to_string(),
    };
    let state = state_label(current, target);

    // Layout
    let width = 70;
    let left_w = 22;
    let right_w = width - left_w - 6; // "│ " + "│  " + "│"

    let title = format!("upshift v{version}");
    let title_dashes = width - 2 - title.len() - 5; // "╭╮" and "─── " + " "
    let top = format!("╭─── {title} {}╮", "─".repeat(title_dashes));
    let bottom = format!("╰{}╯", "─".repeat(width - 2));

    let row = |l: &str, r: &str| format!("│ {:<left_w$}│  {:<right_w$}│", l, r);

    println!("{top}");
    println!("{}", row("", ""));
    println!("{}", row("  Schema upgrade", &truncate(&db_display, right_w)));
    println!("{}", row("", &"─".repeat(right_w - 2)));
    println!("{}", row("", &format!("Current     {current}")));
    println!("{}", row("", &format!("Target      {target}")));
    println!("{}", row("", &format!("State       {state}")));
    println!("{}", row("", ""));
    println!("{bottom}");
}

fn state_label(current: u32, target: u32) -> &'static str {
    match current.cmp(&target) {
        std::cmp::Ordering::Equal => "up to date",
        std::cmp::Ordering::Less => "upgrade needed",
        std::cmp::Ordering::Greater => "newer than this build",
    }
}

/// Keep the tail of long paths, which is the part that identifies them.
fn truncate(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - (max - 1)).collect();
    format!("…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_paths_keep_their_tail() {
        let out = truncate("/very/long/path/to/the/store.db", 10);
        assert_eq!(out.chars().count(), 10);
        assert!(out.ends_with("store.db"));
        assert_eq!(truncate("short.db", 10), "short.db");
    }

    #[test]
    fn state_labels() {
        assert_eq!(state_label(6, 6), "up to date");
        assert_eq!(state_label(2, 6), "upgrade needed");
        assert_eq!(state_label(7, 6), "newer than this build");
    }
}
