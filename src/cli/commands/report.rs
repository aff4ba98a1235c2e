//! Report command - per-session summaries.

use crate::cli::args::ReportArgs;
use crate::collector::{load_events, summarize, SessionSummary};
use anyhow::Result;

pub fn run_report(args: ReportArgs) -> Result<()> {
    let events = load_events(&args.log)?;
    let summaries = summarize(&events);
    if args.json {
        for summary in &summaries {
            println!("{}", serde_json::to_string(summary)?);
        }
    } else {
        print_table(&summaries);
    }
    Ok(())
}

fn print_table(summaries: &[SessionSummary]) {
    if summaries.is_empty() {
        println!("no sessions recorded");
        return;
    }
    println!(
        "{:<16} {:<15} {:>7} {:<16} {:>4} {:>4} {:>10} {:<14}",
        "USER", "SOURCE", "SESSION", "MODE", "OK", "ERR", "DURATION", "AMBIENT"
    );
    for s in summaries {
        println!(
            "{:<16} {:<15} {:>7} {:<16} {:>4} {:>4} {:>10} {:<14}",
            s.user,
            s.src_ip,
            s.session,
            s.modo,
            s.ok_total,
            s.err_total,
            format_ms(s.duration_ms),
            s.mic.ambient
        );
        if !s.by_level.is_empty() {
            let levels: Vec<String> = s
                .by_level
                .iter()
                .map(|(level, tally)| format!("{level}: {} ok | {} err", tally.ok, tally.err))
                .collect();
            println!("{:<16} {}", "", levels.join(", "));
        }
    }
}

fn format_ms(ms: u64) -> String {
    match ms {
        0 => "-".to_string(),
        1..=999 => format!("{ms} ms"),
        _ => format!("{:.2} s", ms as f64 / 1000.0),
    }
}
