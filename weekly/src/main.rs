use std::{
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use weekly::core::{
    Status, ThreePSection, TimeRange, WeekDocument, WeeklyError, truncate_to_minute,
};
use weekly::ops::{self, Mutation, Outcome, TaskScope};
use weekly::schedule::Placement;
use weekly::storage::{DEFAULT_EDITOR, Settings, WeeklyFile};
use weekly::{day_header_positions, format_week, template};

#[derive(Debug, Parser)]
#[command(
    name = "weekly",
    about = "Weekly planning notes: time-blocked tasks and a 3Ps retrospective",
    version
)]
struct Cli {
    /// Print the rewritten note instead of saving it, and log at debug level.
    #[arg(long, short = 'D', global = true)]
    debug: bool,
    /// Day to operate on (YYYY-MM-DD). Defaults to today.
    #[arg(long, short = 'd', global = true)]
    date: Option<NaiveDate>,
    /// Directory holding the notes. Defaults to ~/notes.
    #[arg(long, env = "NOTES_DIR", global = true)]
    notes_dir: Option<PathBuf>,
    /// Directory holding note templates. Defaults to <notes-dir>/templates.
    #[arg(long, env = "TEMPLATES_DIR", global = true)]
    templates_dir: Option<PathBuf>,
    /// Editor command used to open notes.
    #[arg(long, env = "EDITOR", global = true, default_value = DEFAULT_EDITOR)]
    editor: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Add a pending task at an instant (default: now) or within an interval.
    AddTask(AddTaskArgs),

    /// Append a note to the time block starting at --start-time.
    AddNote(AddNoteArgs),

    /// Append a note to one of the 3Ps (progress, planned, problems).
    ThreeP(ThreePArgs),

    /// Change a task's status, addressed by index or by text.
    UpdateTask(UpdateTaskArgs),

    /// List the tasks of the block containing an instant, or of the whole day.
    Tasks(TasksArgs),

    /// List the day's time blocks.
    TimeBlocks,

    /// List the line numbers of the day headers in the weekly note.
    DayLines,

    /// Print the canonical rendering of the weekly note.
    Show(ShowArgs),

    /// Print the path of the weekly note.
    WeeklyPath,

    /// Open the weekly note in the editor, creating it from the `weekly` template.
    Weekly,

    /// Open a named note in the editor, creating it when missing.
    Open(NoteArgs),

    /// Create a named note when missing and print its path.
    NotePath(NoteArgs),
}

#[derive(Debug, Args)]
struct AddTaskArgs {
    /// Task text.
    task: String,
    /// Instant the task belongs to (HH:MM). Defaults to now.
    #[arg(
        long,
        short = 't',
        value_parser = parse_clock_time,
        conflicts_with_all = ["start_time", "end_time"]
    )]
    time: Option<NaiveTime>,
    /// Interval start (HH:MM).
    #[arg(long, short = 's', value_parser = parse_clock_time, requires = "end_time")]
    start_time: Option<NaiveTime>,
    /// Interval end (HH:MM).
    #[arg(long, short = 'e', value_parser = parse_clock_time, requires = "start_time")]
    end_time: Option<NaiveTime>,
}

#[derive(Debug, Args)]
struct AddNoteArgs {
    /// Note text; stored as a `- ` bullet.
    note: String,
    /// Block start (HH:MM). Defaults to now.
    #[arg(long, short = 's', value_parser = parse_clock_time)]
    start_time: Option<NaiveTime>,
    /// Block end (HH:MM). Defaults to 30 minutes after the start.
    #[arg(long, short = 'e', value_parser = parse_clock_time)]
    end_time: Option<NaiveTime>,
}

#[derive(Debug, Args)]
struct ThreePArgs {
    /// progress, planned or problems.
    section: String,
    /// Note text; stored as a `- ` bullet.
    note: String,
}

#[derive(Debug, Args)]
struct UpdateTaskArgs {
    #[command(flatten)]
    target: TaskTarget,
    /// pending, done or canceled.
    #[arg(long, short = 'S')]
    status: String,
    /// With --index: first block starting at or after this time. Defaults to now.
    #[arg(long, short = 's', value_parser = parse_clock_time, conflicts_with = "text")]
    start_time: Option<NaiveTime>,
    /// With --text: block containing this instant. Defaults to now.
    #[arg(long, short = 't', value_parser = parse_clock_time, conflicts_with = "index")]
    time: Option<NaiveTime>,
    /// Fail when --text matches no task instead of leaving the note untouched.
    #[arg(long)]
    require_match: bool,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct TaskTarget {
    /// Zero-based task position inside the block.
    #[arg(long, short = 'u')]
    index: Option<usize>,
    /// Exact task text.
    #[arg(long)]
    text: Option<String>,
}

#[derive(Debug, Args)]
struct TasksArgs {
    /// Instant whose block is listed (HH:MM). Defaults to now.
    #[arg(long, short = 't', value_parser = parse_clock_time)]
    time: Option<NaiveTime>,
    /// List every task of the day.
    #[arg(long, conflicts_with = "time")]
    all_day: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Emit the parsed document as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct NoteArgs {
    /// Note name, without the `.md` extension.
    name: String,
    /// Template applied when the note is created.
    #[arg(long)]
    template: Option<String>,
}

/// Wall-clock inputs, captured once per invocation.
#[derive(Debug, Clone, Copy)]
struct Clock {
    today: NaiveDate,
    now: NaiveTime,
}

impl Clock {
    fn local() -> Self {
        let now = Local::now();
        Self {
            today: now.date_naive(),
            now: truncate_to_minute(now.time()),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let stdout = io::stdout();
    run(cli, Clock::local(), &mut stdout.lock())
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli, clock: Clock, out: &mut dyn Write) -> Result<()> {
    let settings = resolve_settings(&cli)?;
    let date = cli.date.unwrap_or(clock.today);
    let debug = cli.debug;
    debug!(?settings, %date, "resolved invocation");

    match cli.command {
        Commands::AddTask(args) => {
            let placement = match (args.start_time, args.end_time) {
                (Some(start), Some(end)) => Placement::Within(TimeRange::new(start, end)?),
                _ => Placement::At(args.time.unwrap_or(clock.now)),
            };
            let mutation = Mutation::AddTask {
                date,
                placement,
                text: args.task,
            };
            handle_mutation(&settings, date, mutation, debug, out).map(|_| ())
        }
        Commands::AddNote(args) => {
            let start = args.start_time.unwrap_or(clock.now);
            let range = match args.end_time {
                Some(end) => TimeRange::new(start, end)?,
                None => half_hour_from(start)?,
            };
            let mutation = Mutation::AddBlockNote {
                date,
                range,
                note: args.note,
            };
            handle_mutation(&settings, date, mutation, debug, out).map(|_| ())
        }
        Commands::ThreeP(args) => {
            let section = ThreePSection::from_name(&args.section)?;
            let mutation = Mutation::AddThreePNote {
                section,
                note: args.note,
            };
            handle_mutation(&settings, date, mutation, debug, out).map(|_| ())
        }
        Commands::UpdateTask(args) => handle_update_task(&settings, date, clock, args, debug, out),
        Commands::Tasks(args) => {
            let doc = load(&settings, date)?.1;
            let scope = if args.all_day {
                TaskScope::AllDay
            } else {
                TaskScope::At(args.time.unwrap_or(clock.now))
            };
            for task in ops::list_tasks(&doc, date, scope)? {
                writeln!(out, "- [{}] {}", task.status.marker(), task.text)?;
            }
            Ok(())
        }
        Commands::TimeBlocks => {
            let doc = load(&settings, date)?.1;
            for range in ops::time_blocks(&doc, date) {
                writeln!(out, "{range}")?;
            }
            Ok(())
        }
        Commands::DayLines => {
            let file = WeeklyFile::open(settings.weekly_path(date), date)?;
            for header in day_header_positions(file.text()) {
                writeln!(out, "{} {}", header.line, header.weekday)?;
            }
            Ok(())
        }
        Commands::Show(args) => {
            let doc = load(&settings, date)?.1;
            if args.json {
                writeln!(out, "{}", serde_json::to_string_pretty(&doc)?)?;
            } else {
                write!(out, "{}", format_week(&doc))?;
            }
            Ok(())
        }
        Commands::WeeklyPath => {
            writeln!(out, "{}", settings.weekly_path(date).display())?;
            Ok(())
        }
        Commands::Weekly => {
            let path = settings.weekly_path(date);
            let template = settings.template_path("weekly");
            template::ensure_note(&path, Some(&template), date)?;
            template::launch_editor(&settings.editor, &path)?;
            Ok(())
        }
        Commands::Open(args) => {
            let path = prepare_note(&settings, &args, date)?;
            template::launch_editor(&settings.editor, &path)?;
            Ok(())
        }
        Commands::NotePath(args) => {
            let path = prepare_note(&settings, &args, date)?;
            writeln!(out, "{}", path.display())?;
            Ok(())
        }
    }
}

fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let notes_dir = match &cli.notes_dir {
        Some(dir) => dir.clone(),
        None => std::env::var_os("HOME")
            .map(PathBuf::from)
            .context("NOTES_DIR is not set and HOME is unknown")?
            .join("notes"),
    };
    let mut settings = Settings::new(notes_dir);
    if let Some(dir) = &cli.templates_dir {
        settings.templates_dir = dir.clone();
    }
    settings.editor = cli.editor.clone();
    Ok(settings)
}

fn load(settings: &Settings, date: NaiveDate) -> Result<(WeeklyFile, WeekDocument)> {
    let file = WeeklyFile::open(settings.weekly_path(date), date)?;
    let doc = file
        .parse()
        .with_context(|| format!("parsing {:?}", file.path()))?;
    Ok((file, doc))
}

fn handle_mutation(
    settings: &Settings,
    date: NaiveDate,
    mutation: Mutation,
    debug: bool,
    out: &mut dyn Write,
) -> Result<Outcome> {
    let (file, mut doc) = load(settings, date)?;
    let outcome = ops::apply(&mut doc, mutation)?;
    save(&file, &doc, outcome, debug, out)?;
    Ok(outcome)
}

fn handle_update_task(
    settings: &Settings,
    date: NaiveDate,
    clock: Clock,
    args: UpdateTaskArgs,
    debug: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let status: Status = args.status.parse()?;
    let (file, mut doc) = load(settings, date)?;

    let outcome = match (args.target.index, args.target.text) {
        (Some(index), _) => ops::apply(
            &mut doc,
            Mutation::UpdateTaskByIndex {
                date,
                start: args.start_time.unwrap_or(clock.now),
                index,
                status,
            },
        )?,
        (None, Some(text)) => {
            let outcome = ops::apply(
                &mut doc,
                Mutation::UpdateTaskByText {
                    date,
                    at: args.time.unwrap_or(clock.now),
                    text: text.clone(),
                    status,
                },
            )?;
            if outcome == Outcome::Unchanged && args.require_match {
                return Err(WeeklyError::TaskNotFound { date, text }.into());
            }
            outcome
        }
        (None, None) => anyhow::bail!("either --index or --text is required"),
    };
    if outcome == Outcome::Changed {
        info!(%date, %status, "task status updated");
    }

    save(&file, &doc, outcome, debug, out)
}

fn save(
    file: &WeeklyFile,
    doc: &WeekDocument,
    outcome: Outcome,
    debug: bool,
    out: &mut dyn Write,
) -> Result<()> {
    if outcome == Outcome::Unchanged && !debug {
        info!(path = %file.path().display(), "nothing changed; note left as is");
        return Ok(());
    }
    file.commit(doc, debug, out)
        .with_context(|| format!("saving {:?}", file.path()))?;
    Ok(())
}

fn prepare_note(settings: &Settings, args: &NoteArgs, date: NaiveDate) -> Result<PathBuf> {
    let name = args.name.trim();
    if name.is_empty() {
        anyhow::bail!("a note name is required");
    }
    let path = settings.note_path(name);
    let template = args
        .template
        .as_deref()
        .map(|name| settings.template_path(name));
    template::ensure_note(&path, template.as_deref(), date)?;
    Ok(path)
}

fn half_hour_from(start: NaiveTime) -> Result<TimeRange> {
    let (end, wrapped) = start.overflowing_add_signed(chrono::Duration::minutes(30));
    if wrapped != 0 {
        anyhow::bail!(
            "a note starting at {} needs an explicit --end-time",
            start.format("%H:%M")
        );
    }
    Ok(TimeRange::new(start, end)?)
}

fn parse_clock_time(raw: &str) -> std::result::Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| format!("expected HH:MM, got `{raw}`: {e}"))
}
