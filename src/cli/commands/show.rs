//! Show command - print one build record

use super::open_builder;
use crate::cli::args::ShowArgs;
use crate::config::Config;
use crate::error::{BuildhistError, BuildhistResult};
use crate::record::{BuildRecord, BuildResult};
use console::style;

/// Execute the show command
pub async fn execute(args: ShowArgs, config: &Config) -> BuildhistResult<()> {
    let status = open_builder(&args.builder, config).await?;
    let build = status
        .get_build(args.number)
        .await
        .ok_or_else(|| BuildhistError::BuildNotFound {
            builder: status.name().to_string(),
            number: args.number,
        })?;
    let record = build.snapshot();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
    }
    Ok(())
}

pub(super) fn styled_result(result: Option<BuildResult>) -> console::StyledObject<String> {
    let Some(result) = result else {
        return style("running".to_string()).cyan();
    };
    let text = result.to_string();
    match result {
        BuildResult::Success => style(text).green(),
        BuildResult::Warnings => style(text).yellow(),
        BuildResult::Skipped | BuildResult::Cancelled | BuildResult::Resume => style(text).dim(),
        BuildResult::Failure | BuildResult::Exception | BuildResult::Retry => style(text).red(),
    }
}

fn print_record(record: &BuildRecord) {
    println!(
        "{} {}",
        style(format!("{} #{}", record.builder, record.number)).bold(),
        styled_result(record.result)
    );
    println!("  started:  {}", record.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished) = record.finished_at {
        let elapsed = finished - record.started_at;
        println!(
            "  finished: {} ({}s)",
            finished.format("%Y-%m-%d %H:%M:%S"),
            elapsed.num_seconds()
        );
    }
    if !record.reason.is_empty() {
        println!("  reason:   {}", record.reason);
    }
    if !record.responsible_users.is_empty() {
        println!("  blame:    {}", record.responsible_users.join(", "));
    }

    if !record.sourcestamps.is_empty() {
        println!();
        println!("{}", style("Sources:").bold());
        for stamp in &record.sourcestamps {
            println!(
                "  {:<16} {:<20} {}",
                stamp.codebase,
                stamp.branch.as_deref().unwrap_or("-"),
                stamp.revision.as_deref().unwrap_or("-")
            );
        }
    }

    if !record.steps.is_empty() {
        println!();
        println!("{}", style("Steps:").bold());
        for step in &record.steps {
            let state = match (step.started_at, step.finished_at) {
                (_, Some(_)) => style("done").green(),
                (Some(_), None) if step.waiting => style("waiting").yellow(),
                (Some(_), None) => style("running").cyan(),
                (None, None) => style("pending").dim(),
            };
            println!("  {:<24} {}", step.name, state);
        }
    }
}
