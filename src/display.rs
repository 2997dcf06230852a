//! Console rendering helpers.

use crossterm::style::Stylize;

/// Startup banner.
pub fn banner(model: &str, tool_count: usize) {
    println!(
        "{}",
        "Welcome to toolgate! Type 'exit' to quit.".green().bold()
    );
    println!(
        "{}",
        format!("model: {} · tools: {}", model, tool_count).dark_grey()
    );
}

/// Farewell on normal exit.
pub fn farewell() {
    println!("{}", "👋 Bye.".red());
}

/// Assistant-authored text.
pub fn agent_message(text: &str) {
    println!("{} {}", "🤖:".cyan(), text);
}

/// Orchestration status line.
pub fn status(text: &str) {
    println!("{} {}", "⚙️:".dark_grey(), text);
}

/// Something went sideways but the session continues.
pub fn warn(text: &str) {
    eprintln!("{} {}", "⚠️:".yellow(), text);
}

/// A failure worth stopping the current line for.
pub fn error(text: &str) {
    eprintln!("{} {}", "error:".red().bold(), text);
}

/// A tool call going out.
pub fn tool_call(name: &str) {
    println!("{}", format!("→ {}...", name).dark_grey());
}

/// A tool call coming back.
pub fn tool_result(name: &str, ok: bool) {
    let mark = if ok { "✓" } else { "✗" };
    println!("{}", format!("{} {}", mark, name).dark_grey());
}

/// Per-turn usage line, shown in verbose mode.
pub fn turn_stats(input_tokens: u64, output_tokens: u64, tool_uses: u64) {
    println!(
        "{}",
        format!(
            "turn done · tokens {} in / {} out · {} tool calls",
            input_tokens, output_tokens, tool_uses
        )
        .dark_grey()
    );
}
