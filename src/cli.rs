use std::error::Error;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use atty::Stream;
use clap::{Parser, Subcommand};
use corpus_tables::render::{self, RenderMode};
use corpus_tables::session::CellAction;
use corpus_tables::taxonomy::{FlatNode, NodeState};
use corpus_tables::template::{self, Binding, CellPath, TemplateDocument};
use corpus_tables::{CorpusCache, FixtureCorpus, TablesSession};
use serde_json::json;
use termimad::{FmtText, MadSkin, terminal_size};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "corpus-tables",
    about = "Parse, bind and browse dialect corpus table views",
    version
)]
pub struct Cli {
    /// Emit JSON instead of human-readable tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a template file and summarize its tables and bindings.
    Parse {
        /// Template markup file.
        file: PathBuf,
    },
    /// Bind a view from a corpus file and print it.
    Render {
        /// Corpus JSON file with categories, views and answers.
        #[arg(long)]
        corpus: PathBuf,
        /// Leaf category whose table should be shown.
        #[arg(long, conflicts_with = "view", required_unless_present = "view")]
        category: Option<u32>,
        /// View filename, with or without extension.
        #[arg(long)]
        view: Option<String>,
        /// Sample whose answers fill the table.
        #[arg(long)]
        sample: Option<String>,
        /// Render in search mode; bound cells become query targets.
        #[arg(long)]
        search: bool,
        /// Search criterion as `SECTION.TABLE.ROW.CELL=VALUE` (add `.ROW.CELL`
        /// for a cell inside a foreach table). Implies `--search`.
        #[arg(long = "pick", value_parser = parse_pick)]
        picks: Vec<(CellPath, String)>,
    },
    /// Print the category tree.
    Tree {
        /// Corpus JSON file with categories, views and answers.
        #[arg(long)]
        corpus: PathBuf,
        /// Category ids to expand, in order.
        #[arg(long = "expand")]
        expand: Vec<u32>,
        /// Expand every category.
        #[arg(long)]
        all: bool,
    },
    /// Serve the HTML table browser and JSON APIs.
    Serve {
        /// Corpus JSON file with categories, views and answers.
        #[arg(long)]
        corpus: PathBuf,
        /// Listen address.
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Command::Parse { file } => handle_parse(file, cli.json),
        Command::Render {
            corpus,
            category,
            view,
            sample,
            search,
            picks,
        } => {
            let target = match (category, view) {
                (Some(id), _) => Target::Category(id),
                (None, Some(view)) => Target::View(view),
                (None, None) => return Err("provide --category or --view".into()),
            };
            let request = RenderRequest {
                target,
                sample,
                search: search || !picks.is_empty(),
                picks,
            };
            runtime()?.block_on(handle_render(corpus, request, cli.json))
        }
        Command::Tree {
            corpus,
            expand,
            all,
        } => runtime()?.block_on(handle_tree(corpus, expand, all, cli.json)),
        Command::Serve { corpus, addr } => handle_serve(corpus, addr),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

fn parse_pick(raw: &str) -> Result<(CellPath, String), String> {
    let (position, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected POSITION=VALUE, got {raw:?}"))?;
    let indices = position
        .split('.')
        .map(|part| part.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("invalid cell position {position:?}: {err}"))?;
    let path = match indices.as_slice() {
        &[section, table, row, cell] => CellPath {
            section,
            table,
            row,
            cell,
            nested: None,
        },
        &[section, table, row, cell, nested_row, nested_cell] => CellPath {
            section,
            table,
            row,
            cell,
            nested: Some((nested_row, nested_cell)),
        },
        _ => return Err(format!("expected 4 or 6 indices in {position:?}")),
    };
    Ok((path, value.to_string()))
}

fn handle_parse(file: PathBuf, as_json: bool) -> Result<(), Box<dyn Error>> {
    let markup = fs::read_to_string(&file)?;
    let document = template::try_parse(&markup)?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }
    print_outline(&document);
    Ok(())
}

fn print_outline(document: &TemplateDocument) {
    if !document.main_heading.is_empty() {
        println!("{}", document.main_heading);
    }
    for (section_index, section) in document.sections.iter().enumerate() {
        let heading = if section.heading.is_empty() {
            "<untitled>"
        } else {
            section.heading.as_str()
        };
        println!("[{section_index}] {heading}");
        for (table_index, table) in section.tables.iter().enumerate() {
            let cells: Vec<_> = table.rows.iter().flat_map(|row| &row.cells).collect();
            let bound = cells
                .iter()
                .filter(|cell| !matches!(cell.binding, Binding::Static))
                .count();
            let caption = if table.caption.is_empty() {
                String::new()
            } else {
                format!(" \"{}\"", table.caption)
            };
            println!(
                "  table {table_index}{caption}: {} headers, {} rows, {} cells, {bound} bound",
                table.headers.len(),
                table.rows.len(),
                cells.len(),
            );
        }
    }
    let ids: Vec<String> = document
        .referenced_ids()
        .iter()
        .map(u32::to_string)
        .collect();
    if ids.is_empty() {
        println!("No taxonomy references.");
    } else {
        println!("Taxonomy ids: {}", ids.join(", "));
    }
}

enum Target {
    Category(u32),
    View(String),
}

struct RenderRequest {
    target: Target,
    sample: Option<String>,
    search: bool,
    picks: Vec<(CellPath, String)>,
}

async fn handle_render(
    corpus: PathBuf,
    request: RenderRequest,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let corpus = FixtureCorpus::from_path(&corpus)?;
    let mut session = TablesSession::new(corpus, Arc::new(CorpusCache::new()));
    session.select_sample(request.sample).await;
    if request.search {
        session.set_search_mode(true).await;
    }
    let filename = match &request.target {
        Target::Category(id) => session.select_category(*id).await?.filename.clone(),
        Target::View(view) => session.open_view(view).await?.filename.clone(),
    };
    for (path, value) in request.picks {
        match session.click_cell(path).await? {
            CellAction::CaptureCriterion(_) => {
                session.confirm_criterion(value);
            }
            _ => eprintln!("cell {path:?} is not a search target; skipped"),
        }
    }

    let document = session.rendered();
    if as_json {
        let payload = json!({
            "view": filename,
            "sample": session.sample(),
            "search_mode": session.is_search_mode(),
            "document": document,
            "query": session.overlay().query(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    let Some(document) = document else {
        println!("{filename}: no data.");
        return Ok(());
    };
    let mode = if session.is_search_mode() {
        RenderMode::Search
    } else {
        RenderMode::Answers
    };
    let title = match session.sample() {
        Some(sample) => format!("{filename} ({sample})"),
        None => filename,
    };
    render_markdown_block(&title, &render::to_markdown(document));
    if mode == RenderMode::Search {
        println!(
            "\n{} cells can be used as search criteria.",
            render::search_targets(document)
        );
        for criterion in session.criteria() {
            println!(
                "  #{} {} = {:?}",
                criterion.question_id, criterion.field_name, criterion.value
            );
        }
    }
    Ok(())
}

async fn handle_tree(
    corpus: PathBuf,
    expand: Vec<u32>,
    all: bool,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let corpus = FixtureCorpus::from_path(&corpus)?;
    let mut session = TablesSession::new(corpus, Arc::new(CorpusCache::new()));
    session.load_roots().await;
    if all {
        session.expand_all().await;
    } else {
        for id in expand {
            session.expand(id).await;
        }
    }
    let rows = session.navigator().flatten();
    if as_json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print_tree(&rows);
    }
    Ok(())
}

fn print_tree(rows: &[FlatNode<'_>]) {
    if rows.is_empty() {
        println!("No categories.");
        return;
    }
    for row in rows {
        let marker = match row.state {
            NodeState::Expanded => "-",
            NodeState::Loading => "~",
            NodeState::Collapsed if row.node.has_children => "+",
            NodeState::Collapsed => " ",
        };
        let indent = "  ".repeat(row.level);
        match row.node.path.as_deref().filter(|_| row.node.is_end_leaf()) {
            Some(path) => println!("{indent}{marker} {} (#{}) -> {path}", row.node.name, row.node.id),
            None => println!("{indent}{marker} {} (#{})", row.node.name, row.node.id),
        }
    }
}

#[cfg(feature = "web")]
fn handle_serve(corpus: PathBuf, addr: SocketAddr) -> Result<(), Box<dyn Error>> {
    use corpus_tables::web::{WebConfig, serve};

    let config = WebConfig {
        addr,
        corpus_path: corpus,
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))?;
    Ok(())
}

#[cfg(not(feature = "web"))]
fn handle_serve(_corpus: PathBuf, _addr: SocketAddr) -> Result<(), Box<dyn Error>> {
    Err("the HTTP server is disabled; rebuild with `--features web`".into())
}

fn stdout_is_tty() -> bool {
    atty::is(Stream::Stdout)
}

fn markdown_width() -> usize {
    let (width, _) = terminal_size();
    width.max(60) as usize
}

fn render_markdown_block(title: &str, body: &str) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return;
    }
    println!("{title}:\n");
    if stdout_is_tty() {
        let skin = MadSkin::default();
        let formatted = FmtText::from(&skin, trimmed, Some(markdown_width()));
        println!("{formatted}");
    } else {
        println!("{trimmed}");
    }
}
