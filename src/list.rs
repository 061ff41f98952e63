use anyhow::Result;
use colored::Colorize;

use tapmux::config::Config;
use tapmux::grab::GrabVerdict;

/// Print every visible input device and what the configured rules would do
/// with it.
pub fn run_list(config: &Config) -> Result<()> {
    let mut devices: Vec<(String, String)> = evdev::enumerate()
        .map(|(path, device)| {
            (
                device.name().unwrap_or("(unnamed)").to_string(),
                path.display().to_string(),
            )
        })
        .collect();
    devices.sort();

    println!();
    if devices.is_empty() {
        println!("  {} {}", "✗".bright_red().bold(), "no input devices visible".red());
        println!("  {}", "run as root, or join the 'input' group".dimmed());
        println!();
        return Ok(());
    }

    println!(
        "  {}",
        format!("{} input device(s):", devices.len()).bright_white().bold()
    );
    println!();
    for (name, path) in &devices {
        match config.grabs.verdict(name) {
            GrabVerdict::Grab(rule) => {
                println!("    {} {}", "✓".bright_green().bold(), name.green());
                println!(
                    "      {}  {}",
                    path.dimmed(),
                    format!("grab (rule {rule})").green().dimmed()
                );
            }
            GrabVerdict::Ignore(rule) => {
                println!("    {} {}", "○".dimmed(), name.dimmed());
                println!(
                    "      {}  {}",
                    path.dimmed(),
                    format!("ignore (rule {rule})").dimmed()
                );
            }
            GrabVerdict::NoMatch => {
                println!("    {} {}", "○".dimmed(), name.dimmed());
                println!("      {}  {}", path.dimmed(), "no rule matches".dimmed());
            }
        }
    }
    println!();
    Ok(())
}
