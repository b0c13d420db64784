use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, warn};
use worksheet::core::{ItemValue, WorksheetInfo, WorksheetItem};
use worksheet::directive::DirectivePolicy;
use worksheet::form::{self, EditService};
use worksheet::storage::{JsonWorksheetRepository, WorksheetRepository};
use worksheet::{parse_worksheet_text, worksheet_lines};

const DEFAULT_EDITOR: &str = if cfg!(windows) { "notepad" } else { "vim" };

#[derive(Debug, Parser)]
#[command(
    name = "worksheet",
    about = "Full-text editing for worksheets",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Reject stored directives that match no directive grammar.
    #[arg(long, global = true)]
    strict_directives: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create an empty worksheet document.
    New(NewArgs),

    /// Print the text form of a worksheet.
    Print(PrintArgs),

    /// Print the items of a worksheet as (bundle_uuid, value, type) tuples.
    Items(PrintArgs),

    /// Classify a text form into worksheet items.
    Parse(ParseArgs),

    /// Edit a worksheet in an external editor and save the result.
    Edit(EditArgs),
}

#[derive(Debug, Args)]
struct NewArgs {
    /// Path of the worksheet document to create.
    path: PathBuf,
    /// Worksheet name shown in the edit form header.
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct PrintArgs {
    /// Worksheet document (JSON).
    path: PathBuf,
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Text form to classify.
    input: PathBuf,
    /// Emit JSON instead of one line per item.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct EditArgs {
    /// Worksheet document (JSON).
    path: PathBuf,
    /// Editor command, optionally with arguments split on whitespace (e.g. "code --wait").
    /// A path to an existing editor binary is used whole, even if it contains spaces.
    #[arg(long, env = "EDITOR", default_value = DEFAULT_EDITOR)]
    editor: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let policy = if cli.strict_directives {
        DirectivePolicy::Strict
    } else {
        DirectivePolicy::Lenient
    };
    match cli.command {
        Commands::New(args) => handle_new(args),
        Commands::Print(args) => handle_print(args, policy),
        Commands::Items(args) => handle_items(args, policy),
        Commands::Parse(args) => handle_parse(args),
        Commands::Edit(args) => handle_edit(args, policy),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn handle_new(args: NewArgs) -> Result<()> {
    let NewArgs { path, name } = args;
    if path.exists() {
        anyhow::bail!("{:?} already exists", path);
    }
    let info = WorksheetInfo::new(name);
    JsonWorksheetRepository.save(&path, &info)?;
    println!("Created worksheet {} at {:?}", info.uuid, path);
    Ok(())
}

fn handle_print(args: PrintArgs, policy: DirectivePolicy) -> Result<()> {
    let info = JsonWorksheetRepository.load(&args.path, policy)?;
    for line in worksheet_lines(&info) {
        println!("{line}");
    }
    Ok(())
}

fn handle_items(args: PrintArgs, policy: DirectivePolicy) -> Result<()> {
    let info = JsonWorksheetRepository.load(&args.path, policy)?;
    println!("{}", serde_json::to_string_pretty(&info.current_items())?);
    Ok(())
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { input, json } = args;
    let text = fs::read_to_string(&input).with_context(|| format!("reading {:?}", input))?;
    let items = parse_worksheet_text(&text);
    debug!("{:?}: {} items", input, items.len());

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for item in &items {
            println!("{:<11} {}", item.kind(), describe(item));
        }
    }
    Ok(())
}

fn describe(item: &WorksheetItem) -> String {
    match item.value() {
        ItemValue::Absent => format!("{{{}}}", item.bundle_uuid().unwrap_or_default()),
        ItemValue::Text(text) => match item.bundle_uuid() {
            Some(uuid) => format!("[{text}]{{{uuid}}}"),
            None => format!("{text:?}"),
        },
        ItemValue::Directive(d) => match (d.directive, d.display) {
            (Some(kind), Some(mode)) => format!("{} {}", kind.as_str(), mode.as_str()),
            (Some(kind), None) => format!(
                "{} {} -> {}",
                kind.as_str(),
                d.name.as_deref().unwrap_or_default(),
                d.path.as_deref().unwrap_or_default()
            ),
            (None, _) => format!("unrecognized {:?}", d.markup),
        },
    }
}

fn handle_edit(args: EditArgs, policy: DirectivePolicy) -> Result<()> {
    let EditArgs { path, editor } = args;
    let repo = JsonWorksheetRepository;
    let mut info = repo.load(&path, policy)?;
    let editor = ExternalEditor::from_command(&editor)?;

    form::apply_edit(&mut info, &editor)?;
    repo.save(&path, &info)?;
    println!("Saved {} items to {:?}", info.items.len(), path);
    Ok(())
}

/// Edits the form in an external editor process through a temporary file.
#[derive(Debug)]
struct ExternalEditor {
    program: String,
    args: Vec<String>,
}

impl ExternalEditor {
    fn from_command(command: &str) -> Result<Self> {
        let command = command.trim();
        if Path::new(command).is_file() {
            return Ok(Self {
                program: command.to_string(),
                args: vec![],
            });
        }
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().context("editor command is empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn run_on(&self, path: &Path) -> Result<()> {
        debug!("launching {} on {:?}", self.program, path);
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .status()
            .with_context(|| format!("launching editor {:?}", self.program))?;
        if !status.success() {
            // Whatever was saved before the editor quit is still read back.
            warn!("editor {:?} exited with {}", self.program, status);
        }
        Ok(())
    }
}

impl EditService for ExternalEditor {
    fn edit(&self, template: &str) -> Result<Vec<String>> {
        let mut form = tempfile::Builder::new()
            .prefix("worksheet-")
            .suffix(".txt")
            .tempfile()
            .context("creating form file")?;
        form.write_all(template.as_bytes())?;
        form.write_all(b"\n")?;
        form.flush()?;
        let path = form.into_temp_path();

        self.run_on(&path)?;
        let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        Ok(text.lines().map(str::to_string).collect())
    }
}
