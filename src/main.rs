mod andor;
mod body;
mod calltree;
mod cfg;
mod config;
mod dispatch;
mod error;
mod index;
mod ir;
mod linenumber;
mod normalize;
mod paths;
mod query;
mod render;
mod scan;
mod search;
mod summary;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use serde_sarif::sarif::{
    Artifact, Invocation, Result as SarifResult, Run, Sarif, Tool, ToolComponent, SCHEMA_URL,
};

use crate::calltree::{declared_methods, find_entry_points};
use crate::config::{
    AnalysisConfig, BranchLimitPolicy, OutputForm, SearchConfig, DEFAULT_BRANCH_LIMIT,
    DEFAULT_MAX_DEPTH,
};
use crate::index::{read_index, write_index, Index};
use crate::linenumber::LineNumberTable;
use crate::normalize::class_literals;
use crate::query::Query;
use crate::render::Renderer;
use crate::scan::{scan_inputs, ScanOutput};
use crate::search::search;

/// CLI arguments for callgoat execution.
#[derive(Parser, Debug)]
#[command(
    name = "callgoat",
    about = "Keyword search over the call trees of decompiled JVM code, with SARIF output.",
    version
)]
struct Cli {
    #[arg(long, global = true)]
    quiet: bool,
    #[arg(long, global = true)]
    timing: bool,
    /// Log progress at info level; `RUST_LOG` overrides.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the entry points of the input classes.
    EntryPoints {
        #[command(flatten)]
        input: InputArgs,
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// List the methods with code of the input classes.
    Methods {
        #[command(flatten)]
        input: InputArgs,
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// List the string literals passed by the input classes.
    Literals {
        #[command(flatten)]
        input: InputArgs,
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Build call trees and node summaries, and store them as an index.
    Index {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        analysis: AnalysisArgs,
        #[arg(long, value_name = "PATH")]
        output: PathBuf,
    },
    /// Search query words in call trees and report matches as SARIF.
    Search {
        /// Query words: `"literal`, `t.Type`, `m.method`, `m.class/ret/name/param`, or any text.
        #[arg(required = true, value_name = "WORD")]
        words: Vec<String>,
        /// Index written by the `index` command.
        #[arg(long, value_name = "PATH", conflicts_with = "input")]
        index: Option<PathBuf>,
        #[command(flatten)]
        input: OptionalInputArgs,
        #[command(flatten)]
        analysis: AnalysisArgs,
        #[command(flatten)]
        search: SearchArgs,
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    #[arg(long, value_name = "PATH")]
    classpath: Vec<PathBuf>,
    /// Use every method of these classes as entry points.
    #[arg(long = "entry-class", value_name = "CLASS")]
    entry_classes: Vec<String>,
}

#[derive(Args, Debug)]
struct OptionalInputArgs {
    #[arg(long, value_name = "PATH", required_unless_present = "index")]
    input: Option<PathBuf>,
    #[arg(long, value_name = "PATH", requires = "input")]
    classpath: Vec<PathBuf>,
    #[arg(long = "entry-class", value_name = "CLASS", requires = "input")]
    entry_classes: Vec<String>,
}

#[derive(Args, Debug)]
struct AnalysisArgs {
    /// Methods with more branches than this are not analyzed.
    #[arg(long, value_name = "N", default_value_t = DEFAULT_BRANCH_LIMIT)]
    branch_limit: usize,
    #[arg(long, conflicts_with = "branch_limit")]
    no_branch_limit: bool,
    #[arg(long, value_enum, default_value_t = BranchLimitPolicy::Skip)]
    on_branch_limit: BranchLimitPolicy,
    /// Treat a method calling itself as a recursive chain.
    #[arg(long)]
    include_direct_recursion: bool,
}

impl AnalysisArgs {
    fn config(&self) -> AnalysisConfig {
        AnalysisConfig {
            branch_limit: (!self.no_branch_limit).then_some(self.branch_limit),
            on_branch_limit: self.on_branch_limit,
            include_direct_recursion: self.include_direct_recursion,
        }
    }
}

#[derive(Args, Debug)]
struct SearchArgs {
    #[arg(short, long)]
    ignore_case: bool,
    /// Deepest call-tree cut searched for a match.
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,
    #[arg(long, conflicts_with = "max_depth")]
    no_max_depth: bool,
    #[arg(long, value_enum, default_value_t = OutputForm::Path)]
    form: OutputForm,
    /// Print `java.lang.` types with their package.
    #[arg(long)]
    fully_qualified: bool,
    /// JSON line number table used to decorate the output.
    #[arg(long, value_name = "PATH")]
    line_numbers: Option<PathBuf>,
}

impl SearchArgs {
    fn config(&self) -> SearchConfig {
        SearchConfig {
            max_depth: (!self.no_max_depth).then_some(self.max_depth),
            form: self.form,
            fully_qualified: self.fully_qualified,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);
    run(cli)
}

fn init_logger(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let started_at = Instant::now();
    let summary = match cli.command {
        Command::EntryPoints { input, output } => {
            let scan = scan(&input.input, &input.classpath)?;
            let entry_points = find_entry_points(&scan.target_classes(), &input.entry_classes);
            write_lines(output.as_deref(), entry_points.iter().map(ToString::to_string))?;
            format!("classes={} entry_points={}", scan.classes.len(), entry_points.len())
        }
        Command::Methods { input, output } => {
            let scan = scan(&input.input, &input.classpath)?;
            let methods = declared_methods(&scan.target_classes());
            write_lines(output.as_deref(), methods.iter().map(ToString::to_string))?;
            format!("classes={} methods={}", scan.classes.len(), methods.len())
        }
        Command::Literals { input, output } => {
            let scan = scan(&input.input, &input.classpath)?;
            let literals = class_literals(&scan.target_classes())?;
            write_lines(output.as_deref(), literals.iter().cloned())?;
            format!("classes={} literals={}", scan.classes.len(), literals.len())
        }
        Command::Index {
            input,
            analysis,
            output,
        } => {
            let scan = scan(&input.input, &input.classpath)?;
            let index = build_index(&scan, &input.entry_classes, &analysis.config())?;
            write_index(&output, &index)?;
            format!(
                "classes={} entry_points={} nodes={} methods={} literals={}",
                scan.classes.len(),
                index.entry_points.len(),
                index.summaries.len(),
                index.methods().len(),
                index.literals().len()
            )
        }
        Command::Search {
            words,
            index,
            input,
            analysis,
            search: search_args,
            output,
        } => {
            let (index, artifacts) = match (index, input.input) {
                (Some(path), _) => (read_index(&path)?, Vec::new()),
                (None, Some(path)) => {
                    let scan = scan(&path, &input.classpath)?;
                    let index = build_index(&scan, &input.entry_classes, &analysis.config())?;
                    (index, scan.artifacts)
                }
                (None, None) => anyhow::bail!("either --index or --input is required"),
            };
            let lines = search_args
                .line_numbers
                .as_deref()
                .map(LineNumberTable::read)
                .transpose()?;
            let query = Query::compile(&words, search_args.ignore_case)?;
            for pattern in query.patterns() {
                log::debug!("query word {}: {:?}", pattern.word, pattern.kind);
            }
            let config = search_args.config();

            let outcome = search(&index.forest, &index.summaries, &query, &config);
            if outcome.hits.is_empty() && outcome.beyond_max_depth > 0 {
                log::warn!(
                    "all {} matches exceed the max call-tree depth; raise --max-depth to show them",
                    outcome.beyond_max_depth
                );
            }
            if outcome.hits.is_empty() && outcome.without_paths > 0 {
                log::warn!("no path contains every query word; use --form treecut to show such code");
            }
            for hit in &outcome.hits {
                for excerpt in &hit.excerpts {
                    log::debug!("{}: {:?}", hit.callee, excerpt.contribution);
                }
            }

            let renderer = Renderer::new(&query, lines.as_ref(), config.fully_qualified);
            let results = renderer.results(&outcome.hits);
            let result_count = results.len();
            let sarif = build_sarif(artifacts, results, build_invocation());
            write_sarif(output.as_deref(), &sarif)?;
            format!(
                "entry_points={} hits={} results={}",
                index.entry_points.len(),
                outcome.hits.len(),
                result_count
            )
        }
    };

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} {}",
            started_at.elapsed().as_millis(),
            summary
        );
    }

    Ok(())
}

fn scan(input: &Path, classpath: &[PathBuf]) -> Result<ScanOutput> {
    if !input.exists() {
        anyhow::bail!("input not found: {}", input.display());
    }
    for entry in classpath {
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
    }
    scan_inputs(input, classpath)
}

fn build_index(scan: &ScanOutput, entry_classes: &[String], config: &AnalysisConfig) -> Result<Index> {
    let entry_points = find_entry_points(&scan.target_classes(), entry_classes);
    if entry_points.is_empty() {
        log::warn!("no entry points found in the input classes");
    }
    Index::build(&scan.classes, entry_points, config).context("failed to build call trees")
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

fn write_lines(output: Option<&Path>, lines: impl IntoIterator<Item = String>) -> Result<()> {
    let mut writer = output_writer(output)?;
    for line in lines {
        writeln!(writer, "{line}").context("failed to write output")?;
    }
    Ok(())
}

fn write_sarif(output: Option<&Path>, sarif: &Sarif) -> Result<()> {
    let mut writer = output_writer(output)?;
    serde_json::to_writer_pretty(&mut writer, sarif).context("failed to serialize SARIF output")?;
    writer
        .write_all(b"\n")
        .context("failed to write SARIF output")?;
    Ok(())
}

fn build_invocation() -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");

    Invocation::builder()
        .execution_successful(true)
        .arguments(arguments)
        .command_line(command_line)
        .build()
}

fn build_sarif(artifacts: Vec<Artifact>, results: Vec<SarifResult>, invocation: Invocation) -> Sarif {
    let driver = ToolComponent::builder()
        .name("callgoat")
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = if artifacts.is_empty() {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .build()
    } else {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .artifacts(artifacts)
            .build()
    };

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}
