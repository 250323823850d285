/// codexlens: hierarchical code indexing and chain search
///
/// Commands:
/// - index: build or refresh the index tree for a source root
/// - search: chain search (FTS, hybrid, or cascade pipelines)
/// - symbols: project-wide symbol lookup
/// - refs: references to a symbol from the relationship tables
/// - watch: incremental indexing from file-system events
/// - clean: remove a project's indexes and registry entries
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codexlens::config::{CascadeStrategy, Config};
use codexlens::index::{IncrementalIndexer, IndexTreeBuilder};
use codexlens::paths::PathMapper;
use codexlens::search::{ChainSearchEngine, SearchOptions};
use codexlens::storage::registry::RegistryStore;
use codexlens::watcher::IndexWatcher;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codexlens")]
#[command(about = "Local code indexing and chain search", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the index tree for a source root
    Index {
        /// Source directory to index
        path: PathBuf,

        /// Worker threads (defaults to min(cpus, 16))
        #[arg(short, long)]
        workers: Option<usize>,

        /// Force a full reindex, ignoring freshness checks
        #[arg(long)]
        full: bool,

        /// Restrict indexing to these language ids (comma-separated)
        #[arg(short, long)]
        languages: Option<String>,
    },

    /// Chain search from a directory
    Search {
        query: String,

        /// Starting directory (defaults to the current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Traversal depth (-1 = unlimited)
        #[arg(short, long, default_value_t = -1)]
        depth: i32,

        /// Exact identifier matching instead of fuzzy
        #[arg(long)]
        exact: bool,

        /// Hybrid RRF fusion of exact, fuzzy, and vector channels
        #[arg(long)]
        hybrid: bool,

        /// Cascade pipeline: binary, binary_rerank, dense_rerank, staged
        #[arg(long)]
        cascade: Option<String>,

        /// Only return code files
        #[arg(long)]
        code_only: bool,
    },

    /// Project-wide symbol lookup
    Symbols {
        name: String,

        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Filter by kind (class, function, method, ...)
        #[arg(short, long)]
        kind: Option<String>,

        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
    },

    /// References to a symbol
    Refs {
        symbol: String,

        #[arg(short, long)]
        path: Option<PathBuf>,

        #[arg(short, long, default_value_t = -1)]
        depth: i32,

        #[arg(short = 'n', long, default_value_t = 100)]
        limit: usize,
    },

    /// Watch a source root and index changes incrementally
    Watch {
        path: PathBuf,
    },

    /// Remove a project's indexes and registry entries
    Clean {
        path: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let config = Config::load(Some(&cwd)).context("failed to load configuration")?;
    let registry = Arc::new(
        RegistryStore::open(&config.registry_path()).context("failed to open registry")?,
    );
    let mapper = PathMapper::new(config.index_root());

    match cli.command {
        Commands::Index {
            path,
            workers,
            full,
            languages,
        } => {
            let languages: Option<Vec<String>> = languages
                .map(|list| list.split(',').map(|s| s.trim().to_string()).collect());
            let builder = IndexTreeBuilder::new(registry, mapper, config);
            let result = builder
                .build(&path, languages.as_deref(), workers, full)
                .context("index build failed")?;

            println!(
                "Indexed {} files across {} directories",
                result.total_files, result.total_dirs
            );
            for error in &result.errors {
                eprintln!("warning: {error}");
            }
        }

        Commands::Search {
            query,
            path,
            limit,
            offset,
            depth,
            exact,
            hybrid,
            cascade,
            code_only,
        } => {
            let source_path = path.unwrap_or(cwd);
            let engine = ChainSearchEngine::new(registry, mapper, config.clone());

            let options = SearchOptions {
                depth,
                total_limit: limit,
                offset,
                enable_fuzzy: !exact,
                hybrid_mode: hybrid,
                enable_vector: hybrid,
                code_only,
                ..SearchOptions::default()
            };

            let result = match cascade.as_deref() {
                Some(name) => {
                    let strategy = CascadeStrategy::parse(name)
                        .with_context(|| format!("unknown cascade strategy: {name}"))?;
                    engine.cascade_search(
                        strategy,
                        &query,
                        &source_path,
                        limit,
                        config.cascade_coarse_k,
                        &options,
                    )
                }
                None => engine.search(&query, &source_path, &options),
            };

            for hit in &result.results {
                println!("{:>7.3}  {}", hit.score, hit.path);
            }
            eprintln!(
                "{} results from {} indexes in {:.1}ms",
                result.results.len(),
                result.stats.dirs_searched,
                result.stats.time_ms
            );
        }

        Commands::Symbols {
            name,
            path,
            kind,
            limit,
        } => {
            let source_path = path.unwrap_or(cwd);
            let engine = ChainSearchEngine::new(registry, mapper, config);
            let options = SearchOptions {
                total_limit: limit,
                ..SearchOptions::default()
            };

            for symbol in engine.search_symbols(&name, &source_path, kind.as_deref(), &options) {
                println!(
                    "{}  {}  {}:{}-{}",
                    symbol.kind,
                    symbol.name,
                    symbol.file.as_deref().unwrap_or("?"),
                    symbol.range.0,
                    symbol.range.1
                );
            }
        }

        Commands::Refs {
            symbol,
            path,
            depth,
            limit,
        } => {
            let source_path = path.unwrap_or(cwd);
            let engine = ChainSearchEngine::new(registry, mapper, config);

            for reference in engine.search_references(&symbol, &source_path, depth, limit) {
                println!(
                    "{}:{} ({})",
                    reference.file_path, reference.line, reference.relationship_type
                );
            }
        }

        Commands::Watch { path } => {
            let indexer = Arc::new(IncrementalIndexer::new(
                registry,
                mapper,
                config.clone(),
            ));
            let _watcher =
                IndexWatcher::start(&path, &config, indexer).context("failed to start watcher")?;

            // The watcher thread does the work; this loop only keeps the
            // process alive until interrupted.
            println!("Watching {} (ctrl-c to stop)", path.display());
            loop {
                std::thread::sleep(std::time::Duration::from_secs(3600));
            }
        }

        Commands::Clean { path } => {
            let source_root = PathMapper::normalize(&path);
            let Some(project) = registry.get_project(&source_root)? else {
                anyhow::bail!("not an indexed project: {}", source_root.display());
            };

            if project.index_root.exists() {
                std::fs::remove_dir_all(&project.index_root).with_context(|| {
                    format!("failed to remove {}", project.index_root.display())
                })?;
            }
            registry.unregister_project(&source_root)?;
            codexlens::vector::model_lock::release_lock(&project.index_root);
            println!("Removed index for {}", source_root.display());
        }
    }

    Ok(())
}
