use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use pvt::backend::default_backend;
use pvt::config::Config;
use pvt::document::{DocumentSession, SessionOptions, TileStatus};
use pvt::error::{AppError, AppResult};
use pvt::pixel::PixelFormat;
use pvt::render::{TileCache, TileGrid, TileOrigin, TileRequest, TileWorker};

#[derive(Debug, Parser)]
#[command(name = "pvt", version, about = "Render PDF pages as fixed-size tiles")]
struct Cli {
    /// Config file; defaults to $PVT_CONFIG_PATH or the platform config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print page count and document id.
    Info { pdf: PathBuf },
    /// Print page sizes and vertical offsets.
    Dims {
        pdf: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List the tile cells covering one page.
    Grid {
        pdf: PathBuf,
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long, default_value_t = 1.0)]
        scale: f64,
        #[arg(long)]
        tile_width: Option<u32>,
        #[arg(long)]
        tile_height: Option<u32>,
    },
    /// Render one tile to a PNG file.
    Tile(TileArgs),
}

#[derive(Debug, Args)]
struct TileArgs {
    pdf: PathBuf,
    #[arg(long, default_value_t = 0)]
    page: usize,
    #[arg(long, default_value_t = 0.0)]
    row: f64,
    #[arg(long, default_value_t = 0.0)]
    column: f64,
    #[arg(long)]
    tile_width: Option<u32>,
    #[arg(long)]
    tile_height: Option<u32>,
    #[arg(long, default_value_t = 1.0)]
    scale: f64,
    #[arg(long, default_value_t = 0.0)]
    display_width: f64,
    #[arg(long)]
    format: Option<PixelFormat>,
    #[arg(long)]
    out: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run(Cli::parse()).await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    let config = load_config(&cli)?;
    pvt::logging::init(&config.log)?;

    let session = Arc::new(DocumentSession::with_options(
        default_backend(),
        SessionOptions::from_config(&config),
    ));

    match cli.command {
        Command::Info { pdf } => {
            let doc = session.open(&pdf)?;
            println!("path: {}", doc.path.display());
            println!("backend: {}", session.backend_name());
            println!("doc_id: {:016x}", doc.doc_id);
            println!("pages: {}", doc.page_count);
        }
        Command::Dims { pdf, json } => {
            session.open(&pdf)?;
            let dims = session.page_dimensions();
            if json {
                let encoded = serde_json::to_string_pretty(&dims).map_err(|err| {
                    AppError::unsupported(format!("failed to encode dimensions: {err}"))
                })?;
                println!("{encoded}");
            } else {
                for dim in &dims {
                    println!(
                        "{:>5}  {:>8.2} x {:<8.2}  offset {:.2}",
                        dim.page_index, dim.width, dim.height, dim.cumulative_height_offset
                    );
                }
            }
        }
        Command::Grid {
            pdf,
            page,
            scale,
            tile_width,
            tile_height,
        } => {
            session.open(&pdf)?;
            let size = session.page_size(page)?;
            let grid = TileGrid::new(
                size,
                scale,
                tile_width.unwrap_or(config.render.tile_width),
                tile_height.unwrap_or(config.render.tile_height),
            )?;
            println!("{} rows x {} columns", grid.rows(), grid.columns());
            for cell in grid.cells() {
                println!(
                    "row {} column {}: {}x{}",
                    cell.row, cell.column, cell.width, cell.height
                );
            }
        }
        Command::Tile(args) => {
            session.open(&args.pdf)?;
            render_tile_to_png(Arc::clone(&session), &config, args).await?;
        }
    }

    session.close();
    Ok(())
}

fn load_config(cli: &Cli) -> AppResult<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(file) = &cli.log_file {
        config.log.file = Some(file.clone());
    }
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    Ok(config)
}

async fn render_tile_to_png(
    session: Arc<DocumentSession>,
    config: &Config,
    args: TileArgs,
) -> AppResult<()> {
    let request = TileRequest::new(
        args.page,
        TileOrigin::grid(args.row, args.column),
        args.display_width,
        args.tile_width.unwrap_or(config.render.tile_width),
        args.tile_height.unwrap_or(config.render.tile_height),
        args.scale,
        args.format.unwrap_or(config.render.pixel_format),
    )?;

    let mut worker = TileWorker::spawn(session, config.render.worker_threads)?
        .with_cache(TileCache::from_config(&config.cache));
    worker.submit(request)?;
    let Some(result) = worker.recv().await else {
        return Err(AppError::unsupported("tile worker stopped before rendering"));
    };
    let tile = result.outcome?;
    if tile.status != TileStatus::Rendered {
        warn!("page {} rendered as background: {:?}", args.page, tile.status);
    }
    info!(
        "rendered {}x{} {} tile in {:?}",
        tile.buffer.width(),
        tile.buffer.height(),
        tile.buffer.format(),
        result.elapsed
    );

    write_png(&args.out, tile.buffer.width(), tile.buffer.height(), tile.buffer.to_rgba())
}

fn write_png(path: &Path, width: u32, height: u32, rgba: Vec<u8>) -> AppResult<()> {
    let Some(image) = image::RgbaImage::from_raw(width, height, rgba) else {
        return Err(AppError::invalid_argument("tile pixels do not match its size"));
    };
    image.save(path).map_err(|err| {
        AppError::unsupported(format!("failed to write {}: {err}", path.display()))
    })
}
