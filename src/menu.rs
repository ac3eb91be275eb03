//! Interactive menu. All console input goes through [`Prompt`], so scripted
//! prompts can drive it in tests.

use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::{error, info};

use crate::constants::DEFAULT_FINAL_CHUNK_LINES;
use crate::dedupe::DedupeMode;
use crate::error::{AggregatorError, Result};
use crate::export::Partition;
use crate::orchestrator::Orchestrator;

pub trait Prompt {
    /// Asks a question; `None` means input is exhausted.
    fn ask(&mut self, question: &str) -> Option<String>;

    fn show(&mut self, text: &str) {
        println!("{}", text);
    }
}

/// Console adapter over stdin/stdout.
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn ask(&mut self, question: &str) -> Option<String> {
        print!("{}", question);
        io::stdout().flush().ok()?;
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    Automated(Option<Partition>),
    Download,
    Normalize,
    SplitAndDedupe,
    ExportPartitions,
    FinalSplit,
    StrictCleanup,
    Stats,
    Quit,
}

impl MenuChoice {
    pub fn parse(input: &str) -> Option<Self> {
        Some(match input.trim() {
            "1" => MenuChoice::Automated(None),
            "2" => MenuChoice::Automated(Some(Partition::Nicknames)),
            "3" => MenuChoice::Automated(Some(Partition::Emails)),
            "4" => MenuChoice::Automated(Some(Partition::Passwords)),
            "5" => MenuChoice::Download,
            "6" => MenuChoice::Normalize,
            "7" => MenuChoice::SplitAndDedupe,
            "8" => MenuChoice::ExportPartitions,
            "9" => MenuChoice::FinalSplit,
            "10" => MenuChoice::StrictCleanup,
            "11" => MenuChoice::Stats,
            "0" => MenuChoice::Quit,
            _ => return None,
        })
    }
}

const MENU: &str = "\
==== Nickname aggregator ====
 Automated runs
  1) Full pipeline
  2) Nicknames only
  3) Emails only
  4) Passwords only
 Manual steps
  5) Download
  6) Normalize
  7) Split + chunk dedupe
  8) Export all partitions
  9) Final split
 10) Strict cleanup
 11) Stats
  0) Quit";

fn ask_lines_per_file(prompt: &mut dyn Prompt) -> Option<usize> {
    loop {
        let answer = prompt.ask(&format!("Lines per file [{}]: ", DEFAULT_FINAL_CHUNK_LINES))?;
        if answer.is_empty() {
            return Some(DEFAULT_FINAL_CHUNK_LINES);
        }
        match answer.replace(['_', ','], "").parse::<usize>() {
            Ok(n) if n > 0 => return Some(n),
            _ => prompt.show("Please enter a positive number."),
        }
    }
}

async fn run_choice(
    choice: MenuChoice,
    orchestrator: &mut Orchestrator,
    prompt: &mut dyn Prompt,
    clean_root: &Path,
) -> Result<()> {
    match choice {
        MenuChoice::Automated(only) => {
            let stats = orchestrator.run_automated(only).await?;
            prompt.show(&stats.to_string());
        }
        MenuChoice::Download => {
            let report = orchestrator.download().await?;
            prompt.show(&format!(
                "📥 {} sources ready, {} failed",
                report.succeeded.len(),
                report.failed.len()
            ));
        }
        MenuChoice::Normalize => {
            let report = orchestrator.normalize().await?;
            prompt.show(&format!(
                "🧾 {} sources normalized ({} values), {} failed",
                report.artifacts.len(),
                report.total_values(),
                report.failures.len()
            ));
        }
        MenuChoice::SplitAndDedupe => {
            let split = orchestrator.split_normalized(None).await?;
            let dedupe = orchestrator.deduplicate(DedupeMode::Chunks).await?;
            prompt.show(&format!(
                "✂️  {} chunks, {} unique entries in {}",
                split.chunks.len(),
                dedupe.unique,
                dedupe.path.display()
            ));
        }
        MenuChoice::ExportPartitions => {
            let summary = orchestrator.export(crate::export::ExportFormat::All, None).await?;
            prompt.show(&format!("📤 {} files written", summary.files.len()));
        }
        MenuChoice::FinalSplit => {
            let Some(lines) = ask_lines_per_file(prompt) else {
                return Ok(());
            };
            let chunks = orchestrator.split_final(Some(lines)).await?;
            prompt.show(&format!("📦 {} final chunks written", chunks.len()));
        }
        MenuChoice::StrictCleanup => {
            let question = format!(
                "Delete everything in {} outside the allow-list? [y/N]: ",
                clean_root.display()
            );
            let confirmed = prompt
                .ask(&question)
                .map_or(false, |a| matches!(a.to_ascii_lowercase().as_str(), "y" | "yes"));
            if !confirmed {
                prompt.show("Cleanup cancelled.");
                return Ok(());
            }
            let report = orchestrator.clean_strict(clean_root)?;
            prompt.show(&format!(
                "🧽 {} removed, {} could not be removed",
                report.removed.len(),
                report.failed.len()
            ));
        }
        MenuChoice::Stats => prompt.show(&orchestrator.stats().to_string()),
        MenuChoice::Quit => {}
    }
    Ok(())
}

/// Shows the menu until the user quits or input runs out. Stage errors are
/// reported and the menu continues; an interrupt ends it.
pub async fn run_menu(orchestrator: &mut Orchestrator, prompt: &mut dyn Prompt, clean_root: &Path) -> Result<()> {
    loop {
        prompt.show(MENU);
        let Some(answer) = prompt.ask("Choice: ") else {
            return Ok(());
        };
        let Some(choice) = MenuChoice::parse(&answer) else {
            prompt.show(&format!("Invalid choice '{}'.", answer));
            continue;
        };
        if choice == MenuChoice::Quit {
            info!("Leaving menu");
            return Ok(());
        }
        match run_choice(choice, orchestrator, prompt, clean_root).await {
            Ok(()) => {}
            Err(AggregatorError::Interrupted) => return Err(AggregatorError::Interrupted),
            Err(e) => {
                error!("Menu action failed: {}", e);
                prompt.show(&format!("❌ {}", e));
            }
        }
    }
}
