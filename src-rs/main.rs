use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use env_logger::{Env, Target};
use image::{DynamicImage, GenericImageView};
use leafscope::cache::ContentCache;
use leafscope::chat::ChatSession;
use leafscope::config::Settings;
use leafscope::content::Section;
use leafscope::dispatch::Dispatcher;
use leafscope::generator::{resolve_codex_executable, CodexExecGenerator};
use leafscope::geometry::parse_detections;
use leafscope::overlay::{ImageSource, OverlayRenderer, StaticSurface};
use leafscope::pipeline::{RetrievalPipeline, RetryOutcome, SectionBoard, SectionState};
use leafscope::raster::compose;
use leafscope::util::{abs_path, default_sidecar_for, ensure_parent_dir, timestamp_iso, write_json_pretty};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "leafscope",
    version,
    about = "Rice leaf disease overlays and disease information from the command line"
)]
struct Cli {
    /// Settings JSON file (default: $LEAFSCOPE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Draw detection boxes (and an optional heatmap) over a leaf image
    Overlay(OverlayArgs),
    /// Fetch the four-section description of a disease
    Explain(ExplainArgs),
    /// Talk to the rice disease assistant
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
struct OverlayArgs {
    /// Base image path
    image: PathBuf,
    /// Detection JSON (array, or an object with `yolo_detections`)
    detections: PathBuf,
    /// Output PNG path
    output: PathBuf,
    /// Heatmap image multiplied over the base
    #[arg(long)]
    heatmap: Option<PathBuf>,
    /// Displayed width in px (default: natural width, or keep aspect with --height)
    #[arg(long)]
    width: Option<u32>,
    /// Displayed height in px (default: natural height, or keep aspect with --width)
    #[arg(long)]
    height: Option<u32>,
    /// Path to write the scene sidecar (default: <output>.json)
    #[arg(long)]
    meta_out: Option<PathBuf>,
    /// Disable the scene sidecar
    #[arg(long, action = ArgAction::SetTrue)]
    no_meta: bool,
}

#[derive(Args, Debug)]
struct GeneratorArgs {
    /// Override Codex executable path
    #[arg(long)]
    codex_bin: Option<String>,
    /// Optional Codex model override
    #[arg(long)]
    model: Option<String>,
    /// Timeout seconds per codex exec call
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct ExplainArgs {
    /// Disease class label, e.g. Brown_Spot
    category: String,
    /// Only print this section (general, symptoms, treatment, prevention)
    #[arg(long)]
    section: Option<Section>,
    /// Retry each failed section once with a scoped request
    #[arg(long, action = ArgAction::SetTrue)]
    retry_failed: bool,
    /// Emit JSON section states
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    #[command(flatten)]
    generator: GeneratorArgs,
}

#[derive(Args, Debug)]
struct ChatArgs {
    /// Disease class label the conversation is about
    category: String,
    /// Follow-up message, in order (repeatable)
    #[arg(long = "message")]
    messages: Vec<String>,
    /// Emit the transcript as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    #[command(flatten)]
    generator: GeneratorArgs,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .target(Target::Stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Overlay(args) => command_overlay(&settings, args),
        Commands::Explain(args) => command_explain(settings, args),
        Commands::Chat(args) => command_chat(settings, args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "overlay",
            "description": "Render detection boxes, labels and an optional heatmap over a leaf image.",
        }),
        json!({
            "name": "explain",
            "description": "Fetch general information, symptoms, treatment and prevention for a disease.",
        }),
        json!({
            "name": "chat",
            "description": "Ask the rice disease assistant follow-up questions.",
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

/// Largest displayed side the overlay will rasterize.
const MAX_RENDER_SIDE: f64 = 16_384.0;

/// Displayed size for the overlay. A single dimension keeps the aspect ratio.
fn display_size(natural: (u32, u32), width: Option<u32>, height: Option<u32>) -> (f64, f64) {
    let (nw, nh) = (f64::from(natural.0), f64::from(natural.1));
    match (width, height) {
        (Some(w), Some(h)) => (f64::from(w), f64::from(h)),
        (Some(w), None) => (f64::from(w), (f64::from(w) * nh / nw.max(1.0)).round()),
        (None, Some(h)) => ((f64::from(h) * nw / nh.max(1.0)).round(), f64::from(h)),
        (None, None) => (nw, nh),
    }
}

fn command_overlay(settings: &Settings, args: OverlayArgs) -> Result<()> {
    if !args.image.exists() {
        bail!("image not found: {}", args.image.display());
    }
    if matches!(args.width, Some(0)) || matches!(args.height, Some(0)) {
        bail!("--width/--height must be positive");
    }

    let raw = fs::read_to_string(&args.detections)
        .with_context(|| format!("detections not found: {}", args.detections.display()))?;
    let detections = parse_detections(&raw)
        .with_context(|| format!("invalid detections JSON: {}", args.detections.display()))?;

    let base = image::open(&args.image)
        .with_context(|| format!("failed to open image: {}", args.image.display()))?;
    let heatmap = match &args.heatmap {
        Some(path) => Some(
            image::open(path).with_context(|| format!("failed to open heatmap: {}", path.display()))?,
        ),
        None => None,
    };

    let natural = base.dimensions();
    let rendered = display_size(natural, args.width, args.height);
    if rendered.0 > MAX_RENDER_SIDE || rendered.1 > MAX_RENDER_SIDE {
        bail!(
            "rendered size {}x{} exceeds the {MAX_RENDER_SIDE}px limit",
            rendered.0,
            rendered.1
        );
    }
    if rendered.0 < 1.0 || rendered.1 < 1.0 {
        bail!("rendered size {}x{} is empty", rendered.0, rendered.1);
    }

    let mut renderer = OverlayRenderer::new(settings.palette());
    renderer.set_source(ImageSource::Path(abs_path(&args.image)));
    renderer.set_detections(detections);
    renderer.set_heatmap(heatmap.is_some());
    renderer.attach(&StaticSurface {
        natural: Some((f64::from(natural.0), f64::from(natural.1))),
        rendered,
    });
    let scene = renderer.scene();
    log::info!(
        "overlay {:?}: {} detection(s) at {}x{}",
        scene.phase,
        renderer.detections().len(),
        rendered.0,
        rendered.1
    );

    let canvas = compose(&base, heatmap.as_ref(), &scene);
    ensure_parent_dir(&args.output)?;
    DynamicImage::ImageRgba8(canvas)
        .save(&args.output)
        .with_context(|| format!("failed to save output image: {}", args.output.display()))?;

    if !args.no_meta {
        let meta_path = args
            .meta_out
            .clone()
            .unwrap_or_else(|| default_sidecar_for(&args.output));
        let payload = json!({
            "overlay_meta_version": 1,
            "image_path": abs_path(&args.image).display().to_string(),
            "detections_path": abs_path(&args.detections).display().to_string(),
            "heatmap_path": args.heatmap.as_deref().map(|p| abs_path(p).display().to_string()),
            "output_path": abs_path(&args.output).display().to_string(),
            "meta_path": abs_path(&meta_path).display().to_string(),
            "generated_at": timestamp_iso(),
            "scene": serde_json::to_value(&scene)?,
        });
        write_json_pretty(&meta_path, &payload)?;
    }

    println!("{}", abs_path(&args.output).display());
    Ok(())
}

fn build_generator(mut settings: Settings, args: GeneratorArgs) -> Result<CodexExecGenerator> {
    if args.codex_bin.is_some() {
        settings.codex_bin = args.codex_bin;
    }
    if args.model.is_some() {
        settings.model = args.model;
    }
    if let Some(secs) = args.timeout {
        settings.timeout_secs = secs;
    }

    let Some(bin) = resolve_codex_executable(settings.codex_bin.as_deref()) else {
        bail!("codex CLI not found; pass --codex-bin or set LEAFSCOPE_CODEX_BIN");
    };
    Ok(CodexExecGenerator::new(bin, settings.out_dir.join("replies"))
        .with_model(settings.model.clone())
        .with_timeout(settings.timeout()))
}

fn render_board(board: &SectionBoard, only: Option<Section>) -> String {
    let mut out = String::new();
    for section in Section::ALL {
        if only.is_some_and(|s| s != section) {
            continue;
        }
        let body = match board.get(section) {
            SectionState::Ready(text) => text.as_str(),
            SectionState::Failed(message) => message.as_str(),
            SectionState::Loading => "Loading...",
        };
        out.push_str(&format!("## {}\n\n{}\n\n", section.header(), body.trim()));
    }
    out.trim_end().to_string()
}

fn command_explain(settings: Settings, args: ExplainArgs) -> Result<()> {
    let category = args.category.trim();
    if category.is_empty() {
        bail!("category must not be empty");
    }
    let generator = build_generator(settings, args.generator)?;
    let budget = generator.timeout + Duration::from_secs(5);

    let mut pipeline = RetrievalPipeline::new(Arc::new(ContentCache::new()));
    let mut dispatcher = Dispatcher::new(Arc::new(generator));

    if let Some(request) = pipeline.select(category) {
        dispatcher.submit(request);
    }
    dispatcher.wait(&mut pipeline, budget);

    if args.retry_failed {
        let failed: Vec<Section> = match pipeline.states() {
            Some(board) => Section::ALL
                .into_iter()
                .filter(|s| board.get(*s).is_failed())
                .filter(|s| args.section.map_or(true, |only| only == *s))
                .collect(),
            None => Vec::new(),
        };
        // One fetch per key at a time, so sections retry in turn.
        for section in failed {
            match pipeline.retry(category, section) {
                RetryOutcome::Dispatched(request) => {
                    dispatcher.submit(request);
                    dispatcher.wait(&mut pipeline, budget);
                }
                outcome => log::debug!("retry of {section} skipped: {outcome:?}"),
            }
        }
    }

    let Some(board) = pipeline.states() else {
        bail!("no content state for {category}");
    };

    if args.json {
        let sections: serde_json::Map<String, Value> = Section::ALL
            .into_iter()
            .filter(|s| args.section.map_or(true, |only| only == *s))
            .map(|s| Ok((s.as_str().to_string(), serde_json::to_value(board.get(s))?)))
            .collect::<Result<_>>()?;
        let payload = json!({
            "category": category,
            "generated_at": timestamp_iso(),
            "sections": sections,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", render_board(board, args.section));
    }
    Ok(())
}

fn command_chat(settings: Settings, args: ChatArgs) -> Result<()> {
    let generator = build_generator(settings, args.generator)?;
    let mut session = ChatSession::new(Some(args.category.clone()));
    session.start(&generator);
    for message in &args.messages {
        if session.send(&generator, message).is_none() {
            log::warn!("skipping blank chat message");
        }
    }

    if args.json {
        let payload = json!({
            "category": session.category(),
            "messages": session.messages(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for turn in session.messages() {
            println!("{}: {}\n", turn.role.title(), turn.content.trim());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_dimension_keeps_aspect() {
        assert_eq!(display_size((640, 480), Some(320), None), (320.0, 240.0));
        assert_eq!(display_size((640, 480), None, Some(240)), (320.0, 240.0));
        assert_eq!(display_size((640, 480), Some(100), Some(100)), (100.0, 100.0));
        assert_eq!(display_size((640, 480), None, None), (640.0, 480.0));
    }

    #[test]
    fn board_renders_markdown() {
        let mut board = SectionBoard::failed("nope");
        board.general = SectionState::Ready("Causes yellowing.".into());
        let text = render_board(&board, None);
        assert!(text.starts_with("## General Information\n\nCauses yellowing."));
        assert!(text.contains("## Prevention\n\nnope"));
        assert_eq!(render_board(&board, Some(Section::Symptoms)), "## Symptoms\n\nnope");
    }

    #[test]
    fn overlay_writes_image_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("leaf.png");
        image::RgbaImage::from_pixel(40, 20, image::Rgba([255, 255, 255, 255]))
            .save(&image_path)
            .unwrap();
        let detections_path = dir.path().join("detections.json");
        fs::write(
            &detections_path,
            r#"{"yolo_detections": [{"box": [4, 2, 20, 12], "class_name": "Tungro", "confidence": 0.9}]}"#,
        )
        .unwrap();
        let output = dir.path().join("out").join("overlay.png");

        command_overlay(
            &Settings::default(),
            OverlayArgs {
                image: image_path,
                detections: detections_path,
                output: output.clone(),
                heatmap: None,
                width: Some(20),
                height: None,
                meta_out: None,
                no_meta: false,
            },
        )
        .unwrap();

        let rendered = image::open(&output).unwrap();
        assert_eq!(rendered.dimensions(), (20, 10));
        let meta: Value =
            serde_json::from_str(&fs::read_to_string(default_sidecar_for(&output)).unwrap()).unwrap();
        assert_eq!(meta["scene"]["phase"], json!("ready"));
        assert_eq!(meta["scene"]["content"]["kind"], json!("boxes"));
        assert_eq!(meta["scene"]["content"]["boxes"][0]["rect"]["left"], json!(2.0));
    }

    #[test]
    fn overlay_rejects_oversized_render() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("leaf.png");
        image::RgbaImage::from_pixel(40, 20, image::Rgba([255, 255, 255, 255]))
            .save(&image_path)
            .unwrap();
        let detections_path = dir.path().join("detections.json");
        fs::write(&detections_path, "[]").unwrap();
        let output = dir.path().join("huge.png");

        let result = command_overlay(
            &Settings::default(),
            OverlayArgs {
                image: image_path,
                detections: detections_path,
                output: output.clone(),
                heatmap: None,
                width: Some(1_000_000),
                height: None,
                meta_out: None,
                no_meta: true,
            },
        );
        assert!(result.unwrap_err().to_string().contains("exceeds"));
        assert!(!output.exists());
    }

    #[test]
    fn cli_parses_repeated_messages() {
        let cli = Cli::parse_from(["leafscope", "chat", "Tungro", "--message", "a", "--message", "b"]);
        match cli.command {
            Commands::Chat(args) => assert_eq!(args.messages, vec!["a", "b"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
