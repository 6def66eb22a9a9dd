//! CLI command implementations.
//!
//! Each `run_*` function backs one `sidx` subcommand. They print to stdout
//! and leave logging (and progress) to stderr. A fenced or queued operation
//! is not a failure: it is reported and the command exits successfully.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};

use search_harness_core::models::{FieldValue, IndexDef};
use search_harness_core::query::{
    facet_tag, Conjunction, ConditionGroup, ConditionValue, FacetOperator, FacetRequest, Keys,
    Operator, Query, ResultSet, SortDirection,
};

use crate::indexing::{DefinitionChange, Engine, IndexReport, SyncOutcome};
use crate::progress::IndexProgressReporter;
use crate::server::SweepReport;

/// Options of `sidx search`.
#[derive(Debug, Default, Clone)]
pub struct SearchOptions {
    pub keys: Option<String>,
    pub fields: Vec<String>,
    pub filters: Vec<String>,
    pub facets: Vec<String>,
    pub sorts: Vec<String>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub partial: Option<bool>,
    pub json: bool,
}

/// Operators in match order; longer spellings first.
const OPERATORS: &[&str] = &[
    "NOT BETWEEN",
    "NOT IN",
    "BETWEEN",
    "IN",
    "<=",
    ">=",
    "<>",
    "!=",
    "==",
    "=",
    "<",
    ">",
];

/// Parse `field OP value`. Lists (`IN`) and ranges (`BETWEEN`) are comma
/// separated; `NULL` with `=`/`<>` tests for absence/presence.
pub fn parse_filter(index: &IndexDef, raw: &str) -> Result<(String, Operator, ConditionValue)> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| c.is_whitespace() || "=<>!".contains(c))
        .with_context(|| format!("Filter '{}' has no operator", raw))?;
    let field = &raw[..split];
    let rest = raw[split..].trim_start();

    let op_str = OPERATORS
        .iter()
        .find(|op| {
            let Some(head) = rest.get(..op.len()) else {
                return false;
            };
            let is_word = op.chars().all(|c| c.is_ascii_alphabetic() || c == ' ');
            head.eq_ignore_ascii_case(op)
                && (!is_word || rest[op.len()..].starts_with(char::is_whitespace))
        })
        .with_context(|| format!("Filter '{}' has no valid operator", raw))?;
    let operator: Operator = op_str.parse()?;
    let value = rest[op_str.len()..].trim();

    let field_type = index.require_field(field)?.field_type;
    let parse = |v: &str| FieldValue::parse_for(field_type, v.trim());
    let value = match operator {
        Operator::Eq | Operator::NotEq if value.eq_ignore_ascii_case("NULL") => ConditionValue::Null,
        Operator::In | Operator::NotIn => ConditionValue::List(
            value
                .split(',')
                .map(parse)
                .collect::<std::result::Result<Vec<_>, _>>()?,
        ),
        Operator::Between | Operator::NotBetween => {
            let Some((low, high)) = value.split_once(',') else {
                bail!("Filter '{}' needs a range written as low,high", raw);
            };
            ConditionValue::Range(parse(low)?, parse(high)?)
        }
        _ => ConditionValue::Single(parse(value)?),
    };
    Ok((field.to_string(), operator, value))
}

/// Parse `field[:or][:missing]`.
pub fn parse_facet(raw: &str) -> Result<FacetRequest> {
    let mut parts = raw.split(':');
    let field = parts.next().filter(|f| !f.is_empty());
    let Some(field) = field else {
        bail!("Facet '{}' has no field", raw);
    };
    let mut facet = FacetRequest::new(field);
    for flag in parts {
        facet = match flag {
            "or" => facet.operator(FacetOperator::Or),
            "missing" => facet.missing(true),
            other => bail!("Unknown facet option '{}' in '{}'", other, raw),
        };
    }
    Ok(facet)
}

/// Parse `field[:asc|:desc]`.
pub fn parse_sort(raw: &str) -> Result<(String, SortDirection)> {
    match raw.split_once(':') {
        None => Ok((raw.to_string(), SortDirection::Asc)),
        Some((field, "asc")) => Ok((field.to_string(), SortDirection::Asc)),
        Some((field, "desc")) => Ok((field.to_string(), SortDirection::Desc)),
        Some((_, other)) => bail!("Unknown sort direction '{}'", other),
    }
}

/// Build a query from CLI options. Filters on the same field share one group
/// tagged `facet:<field>`; the group is an OR when that field has an OR facet.
pub fn build_query(index: &IndexDef, options: &SearchOptions) -> Result<Query> {
    let mut query = Query::new().range(options.offset, options.limit);
    if let Some(keys) = options.keys.as_deref().and_then(Keys::parse) {
        query = query.keys(keys);
    }
    if !options.fields.is_empty() {
        query = query.fulltext_fields(options.fields.clone());
    }
    if let Some(partial) = options.partial {
        query = query.partial_matches(partial);
    }

    let mut or_fields = BTreeSet::new();
    for raw in &options.facets {
        let facet = parse_facet(raw)?;
        if facet.operator == FacetOperator::Or {
            or_fields.insert(facet.field.clone());
        }
        query = query.facet(facet);
    }

    let mut by_field: BTreeMap<String, Vec<(Operator, ConditionValue)>> = BTreeMap::new();
    for raw in &options.filters {
        let (field, operator, value) = parse_filter(index, raw)?;
        by_field.entry(field).or_default().push((operator, value));
    }
    for (field, conditions) in by_field {
        let conjunction = if or_fields.contains(&field) {
            Conjunction::Or
        } else {
            Conjunction::And
        };
        let mut group = ConditionGroup::new(conjunction).tag(facet_tag(&field));
        for (operator, value) in conditions {
            group.add_condition(field.clone(), value, operator);
        }
        query = query.condition_group(group);
    }

    for raw in &options.sorts {
        let (field, direction) = parse_sort(raw)?;
        query = query.sort(field, direction);
    }
    Ok(query)
}

pub async fn run_search(engine: &Engine, index_id: &str, options: &SearchOptions) -> Result<()> {
    let index = engine.index(index_id)?;
    let query = build_query(index, options)?;
    let results = engine.search(index_id, &query).await?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results(&results, options.offset);
    }
    Ok(())
}

fn print_results(results: &ResultSet, offset: usize) {
    for warning in &results.warnings {
        println!("warning: {}", warning);
    }
    if !results.ignored_keys.is_empty() {
        println!("ignored keys: {}", results.ignored_keys.join(", "));
    }
    if results.items.is_empty() {
        println!("No results.");
    } else {
        println!("{} result(s):", results.result_count);
        println!();
        for (i, item) in results.items.iter().enumerate() {
            println!("{}. [{:.2}] {}", offset + i + 1, item.score, item.id);
        }
    }
    for (field, buckets) in &results.facets {
        println!();
        println!("facet {}:", field);
        for bucket in buckets {
            println!("    {:<30} {}", bucket.filter, bucket.count);
        }
    }
}

fn print_outcome(outcome: &SyncOutcome) {
    let change = match &outcome.change {
        DefinitionChange::Unchanged => "unchanged".to_string(),
        DefinitionChange::Added => "added".to_string(),
        DefinitionChange::Updated { reindex: true } => "updated, reindex required".to_string(),
        DefinitionChange::Updated { reindex: false } => "updated".to_string(),
        DefinitionChange::Moved { from } => format!("moved from server '{}'", from),
        DefinitionChange::Removed => "removed".to_string(),
    };
    println!("index {}: definition {}", outcome.index, change);
    if let Some(deferred) = &outcome.deferred {
        println!("  deferred: {}", deferred);
    }
}

fn print_index_report(index_id: &str, report: &IndexReport) {
    println!(
        "index {}: {} indexed, {} removed, {} remaining",
        index_id, report.indexed, report.removed, report.remaining
    );
    if let Some(deferred) = &report.deferred {
        println!("  deferred: {}", deferred);
    }
}

fn print_sweep(report: &SweepReport) {
    if report.skipped {
        println!(
            "server {}: another sweep is running ({} task(s) pending)",
            report.server, report.remaining
        );
        return;
    }
    println!(
        "server {}: {} task(s) executed, {} remaining",
        report.server, report.executed, report.remaining
    );
    if let Some(error) = &report.error {
        println!("  stopped: {}", error);
    }
}

/// Indexes named on the command line, or all configured ones.
fn selected_indexes(engine: &Engine, index: Option<&str>) -> Result<Vec<String>> {
    match index {
        Some(id) => Ok(vec![engine.index(id)?.id.clone()]),
        None => Ok(engine.indexes().map(|i| i.id.clone()).collect()),
    }
}

/// Apply definitions, track datasources, and index pending items.
pub async fn run_sync(
    engine: &Engine,
    index: Option<&str>,
    limit: Option<usize>,
    progress: &dyn IndexProgressReporter,
) -> Result<()> {
    if index.is_none() {
        for outcome in engine.prune_removed_indexes().await? {
            print_outcome(&outcome);
        }
    }
    for index_id in selected_indexes(engine, index)? {
        let outcome = engine.sync_index(&index_id).await?;
        print_outcome(&outcome);
        let tracked = engine.track_datasource(&index_id, progress).await?;
        println!(
            "index {}: {} item(s) in datasource, {} new, {} removed",
            index_id, tracked.total, tracked.added, tracked.removed
        );
        let report = engine.index_pending(&index_id, limit, progress).await?;
        print_index_report(&index_id, &report);
    }
    Ok(())
}

pub async fn run_index(
    engine: &Engine,
    index_id: &str,
    limit: Option<usize>,
    progress: &dyn IndexProgressReporter,
) -> Result<()> {
    let report = engine.index_pending(index_id, limit, progress).await?;
    print_index_report(index_id, &report);
    Ok(())
}

pub async fn run_reindex(engine: &Engine, index_id: &str) -> Result<()> {
    let marked = engine.reindex(index_id).await?;
    println!("index {}: {} item(s) marked for reindexing", index_id, marked);
    Ok(())
}

pub async fn run_clear(engine: &Engine, index_id: &str) -> Result<()> {
    let deferred = engine.clear(index_id).await?;
    println!("index {}: cleared; all items marked for reindexing", index_id);
    if let Some(deferred) = deferred {
        println!("  deferred: {}", deferred);
    }
    Ok(())
}

/// Execute pending tasks, then index up to one batch per index.
pub async fn run_cron(engine: &Engine, progress: &dyn IndexProgressReporter) -> Result<()> {
    for report in engine.execute_all_tasks().await? {
        print_sweep(&report);
    }
    for index in engine.indexes() {
        let report = engine
            .index_pending(&index.id, Some(index.options.cron_limit), progress)
            .await?;
        print_index_report(&index.id, &report);
    }
    Ok(())
}

pub async fn run_tasks(engine: &Engine, server: Option<&str>, clear: bool) -> Result<()> {
    let servers: Vec<_> = match server {
        Some(id) => vec![engine.server(id)?],
        None => engine.servers().collect(),
    };
    for server in servers {
        if clear {
            let removed = server.tasks().clear_server(server.id()).await?;
            println!("server {}: {} task(s) deleted", server.id(), removed);
            continue;
        }
        let tasks = server.tasks().pending(server.id()).await?;
        println!("server {}: {} pending task(s)", server.id(), tasks.len());
        for task in tasks {
            println!(
                "  #{:<6} {:<24} {:<20} queued {}",
                task.id,
                task.task_type.to_string(),
                task.index_id,
                chrono::DateTime::from_timestamp(task.created_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| task.created_at.to_string())
            );
        }
    }
    Ok(())
}

pub async fn run_schema(engine: &Engine, index_id: &str) -> Result<()> {
    let index = engine.index(index_id)?;
    let server = engine.server(&index.server)?;
    match server.schema_map(index).await? {
        Some(schema) => println!("{}", serde_json::to_string_pretty(&schema)?),
        None => println!("Index '{}' has no storage yet. Run `sidx sync` first.", index_id),
    }
    Ok(())
}

pub async fn run_uninstall(engine: &Engine) -> Result<()> {
    let dropped = engine.uninstall().await?;
    println!("Dropped {} table(s).", dropped.len());
    Ok(())
}
