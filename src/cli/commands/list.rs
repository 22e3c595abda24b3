//! List command - show finished builds, newest first

use super::open_builder;
use super::show::styled_result;
use crate::builder::BuildQuery;
use crate::cli::args::{ListArgs, OutputFormat};
use crate::config::Config;
use crate::error::BuildhistResult;
use crate::record::BuildRecord;
use console::style;

/// Execute the list command
pub async fn execute(args: ListArgs, config: &Config) -> BuildhistResult<()> {
    let status = open_builder(&args.builder, config).await?;
    if let Some(project) = &args.project {
        let codebases = config
            .projects
            .get(project)
            .map(|p| p.codebases.clone())
            .unwrap_or_default();
        status.set_project(Some(project.clone()), codebases);
    }

    let mut query = BuildQuery::new().limit(args.limit);
    for branch in args.branch {
        query = query.branch(branch);
    }
    for (codebase, branch) in args.codebase {
        query = query.codebase(codebase, branch);
    }
    for result in args.result {
        query = query.result(result);
    }

    let records: Vec<BuildRecord> = status
        .finished_builds(query)
        .collect()
        .await
        .iter()
        .map(|b| b.snapshot())
        .collect();

    if records.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => println!("No finished builds for {}", status.name()),
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(status.name(), &records),
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Plain => print_plain(&records),
    }

    Ok(())
}

fn print_table(builder: &str, records: &[BuildRecord]) {
    println!("{}", style(format!("Builds of {}", builder)).bold().cyan());
    println!(
        "{:<8} {:<12} {:<18} {:<30}",
        style("NUMBER").bold(),
        style("RESULT").bold(),
        style("FINISHED").bold(),
        style("SOURCES").bold()
    );
    println!("{}", "-".repeat(70));

    for record in records {
        let finished = record
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let sources = record
            .sourcestamps
            .iter()
            .map(|s| format!("{}@{}", s.codebase, s.branch.as_deref().unwrap_or("?")))
            .collect::<Vec<_>>()
            .join(" ");

        println!(
            "{:<8} {:<12} {:<18} {:<30}",
            record.number,
            styled_result(record.result),
            finished,
            sources
        );
    }

    println!();
    println!("{} build(s)", records.len());
}

fn print_json(records: &[BuildRecord]) -> BuildhistResult<()> {
    let json = serde_json::to_string_pretty(records)?;
    println!("{}", json);
    Ok(())
}

fn print_plain(records: &[BuildRecord]) {
    for record in records {
        let result = record.result.map(|r| r.to_string()).unwrap_or_default();
        println!("{} {}", record.number, result);
    }
}
