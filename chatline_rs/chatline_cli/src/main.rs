use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::panic;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chatline::{
    chat_lines, parse_chats, tidy_chats, unique_chats, Chat, ChatLines, Curve, NameResolver,
    NoResolver, OptimisationProfile, Settings, Weighting,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const MS_PER_DAY: f64 = 86_400_000.0;

/// JSON dump of one chat's lines together with the settings that made them.
#[derive(Serialize)]
struct LinesDump<'a> {
    chat: &'a str,
    participants: &'a [String; 2],
    settings: &'a Settings,
    settings_hash: &'a str,
    lines: &'a ChatLines,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Conversation balance curves for two-person chats", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the chats found in one or more exports
    List(ListArgs),
    /// Compute density lines for a chat and write CSV/plots
    Lines(LinesArgs),
    /// Find the message nearest to (at or before) a point in time
    Locate(LocateArgs),
}

#[derive(Parser, Debug)]
struct InputArgs {
    /// Chat exports (WhatsApp .txt, Facebook .json, Twitter direct-messages.js)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// JSON object mapping sender ids to display names
    #[arg(long, value_hint = ValueHint::FilePath)]
    names: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ListArgs {
    #[command(flatten)]
    input: InputArgs,
}

#[derive(Parser, Debug)]
struct LinesArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Index of the chat to draw (see `list`)
    #[arg(long, default_value_t = 0)]
    chat: usize,

    /// Draw every chat, writing `<stem>_<index>` outputs
    #[arg(long, action = ArgAction::SetTrue)]
    all: bool,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "lines.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Also dump the computed lines as JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Output PNG figure path (defaults next to CSV)
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Output SVG figure path
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Disable plot generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Sampling profile
    #[arg(long, value_enum, default_value_t = ProfileOpt::Slow)]
    profile: ProfileOpt,

    /// Settings JSON (flags below override it)
    #[arg(long, value_hint = ValueHint::FilePath)]
    settings: Option<PathBuf>,

    /// Swap which participant is drawn first
    #[arg(long, action = ArgAction::SetTrue)]
    flipped: bool,

    #[arg(long)]
    closeness_damping: Option<f64>,

    #[arg(long)]
    scaling: Option<f64>,

    #[arg(long)]
    log_scaling: Option<f64>,

    #[arg(long, allow_hyphen_values = true)]
    bandwidth_bias: Option<f64>,

    #[arg(long)]
    bandwidth_variance: Option<f64>,

    /// Inset range `START,END` (RFC 3339, `YYYY-MM-DD HH:MM` or `YYYY-MM-DD`)
    #[arg(long)]
    range: Option<String>,

    /// Emit the full contour fan instead of the balance line alone
    #[arg(long, action = ArgAction::SetTrue)]
    contour: bool,

    /// Weight messages by length instead of counting them
    #[arg(long, action = ArgAction::SetTrue)]
    length_weighting: bool,

    /// Log per-stage timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile_stages: bool,
}

#[derive(Parser, Debug)]
struct LocateArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Index of the chat to search (see `list`)
    #[arg(long, default_value_t = 0)]
    chat: usize,

    /// Point in time (RFC 3339, `YYYY-MM-DD HH:MM` or `YYYY-MM-DD`)
    #[arg(long)]
    at: String,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ProfileOpt {
    Fast,
    Slow,
}

impl From<ProfileOpt> for OptimisationProfile {
    fn from(value: ProfileOpt) -> Self {
        match value {
            ProfileOpt::Fast => OptimisationProfile::FAST,
            ProfileOpt::Slow => OptimisationProfile::SLOW,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::List(args) => args.input.verbose,
        Command::Lines(args) => args.input.verbose,
        Command::Locate(args) => args.input.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::List(args) => handle_list(args),
        Command::Lines(args) => handle_lines(args),
        Command::Locate(args) => handle_locate(args),
    }
}

fn load_names(path: &Path) -> Result<HashMap<String, String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read names {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a JSON object of names", path.display()))
}

/// Read and tidy every chat in `args.inputs`, parsing files in parallel.
fn load_chats(args: &InputArgs) -> Result<Vec<Chat>> {
    let names = args.names.as_deref().map(load_names).transpose()?;
    let resolver: &(dyn NameResolver + Sync) = match names.as_ref() {
        Some(map) => map,
        None => &NoResolver,
    };

    let t_parse = Instant::now();
    let parsed = args
        .inputs
        .par_iter()
        .map(|path| -> Result<Vec<Chat>> {
            let data =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            let name = path.to_string_lossy();
            parse_chats(&data, &name, resolver)
                .with_context(|| format!("could not understand {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let chats = tidy_chats(unique_chats(parsed.into_iter().flatten().collect()));
    debug!(
        "Parse stage: {:.1} ms",
        t_parse.elapsed().as_secs_f64() * 1000.0
    );
    if chats.is_empty() {
        return Err(anyhow!("no two-person chats with enough messages found"));
    }
    info!("Loaded {} chats", chats.len());
    Ok(chats)
}

fn select_chat(chats: &[Chat], index: usize) -> Result<&Chat> {
    chats
        .get(index)
        .ok_or_else(|| anyhow!("chat index {} out of range (found {})", index, chats.len()))
}

fn handle_list(args: ListArgs) -> Result<()> {
    let chats = load_chats(&args.input)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (idx, chat) in chats.iter().enumerate() {
        let [a, b] = chat.participants();
        let (first, last) = chat.time_span();
        writeln!(
            out,
            "{:>3}  {} + {}  {} messages  {:.1} days  [{}] {}",
            idx,
            a,
            b,
            chat.len(),
            (last - first) / MS_PER_DAY,
            chat.provider().as_str(),
            chat.key()
        )?;
    }
    Ok(())
}

fn handle_locate(args: LocateArgs) -> Result<()> {
    let chats = load_chats(&args.input)?;
    let chat = select_chat(&chats, args.chat)?;
    let at = parse_datetime(&args.at)?;
    let idx = chat
        .nearest_message(at)
        .ok_or_else(|| anyhow!("chat has no messages"))?;
    let message = &chat.messages()[idx];
    println!(
        "{}  [{}] {}: {}",
        idx,
        message.datetime.format("%Y-%m-%d %H:%M"),
        message.sender,
        message.text.trim_end()
    );
    Ok(())
}

fn build_settings(args: &LinesArgs) -> Result<Settings> {
    let mut settings = match args.settings.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read settings {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid settings JSON", path.display()))?
        }
        None => Settings::default(),
    };
    if args.flipped {
        settings.flipped = true;
    }
    if let Some(v) = args.closeness_damping {
        settings.closeness_damping = v;
    }
    if let Some(v) = args.scaling {
        settings.scaling = v;
    }
    if let Some(v) = args.log_scaling {
        settings.log_scaling = v;
    }
    if let Some(v) = args.bandwidth_bias {
        settings.bandwidth_bias = v;
    }
    if args.bandwidth_variance.is_some() {
        settings.bandwidth_variance = args.bandwidth_variance;
    }
    if let Some(range) = args.range.as_ref() {
        settings.selected_range = Some(parse_range(range)?);
    }
    if args.contour {
        settings.contour = true;
    }
    if args.length_weighting {
        settings.weighting = Weighting::Length;
    }
    settings.validate()?;
    Ok(settings)
}

fn handle_lines(args: LinesArgs) -> Result<()> {
    let settings = build_settings(&args)?;
    let settings_hash = settings.params_hash_sha256()?;
    let profile: OptimisationProfile = args.profile.into();
    info!(
        "Settings {} (profile {:?})",
        &settings_hash[..12],
        args.profile
    );

    let chats = load_chats(&args.input)?;
    let selected: Vec<(usize, &Chat)> = if args.all {
        chats.iter().enumerate().collect()
    } else {
        vec![(args.chat, select_chat(&chats, args.chat)?)]
    };

    let t_compute = Instant::now();
    let computed = selected
        .par_iter()
        .map(|&(idx, chat)| {
            let lines = chat_lines(chat, &settings, &profile)
                .with_context(|| format!("failed to compute lines for {}", chat.key()))?;
            Ok::<_, anyhow::Error>((idx, chat, lines))
        })
        .collect::<Result<Vec<_>>>()?;
    if args.profile_stages || args.input.verbose {
        info!(
            "Compute stage: {:.1} ms ({} chats)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            computed.len()
        );
    }

    for (idx, chat, lines) in &computed {
        let output = if args.all {
            indexed_path(&args.output, *idx)
        } else {
            args.output.clone()
        };
        let dump = LinesDump {
            chat: chat.key(),
            participants: chat.participants(),
            settings: &settings,
            settings_hash: &settings_hash,
            lines,
        };
        write_outputs(&args, &output, *idx, &dump)?;
    }
    Ok(())
}

fn write_outputs(args: &LinesArgs, output: &Path, idx: usize, dump: &LinesDump) -> Result<()> {
    let lines = dump.lines;
    let t_csv = Instant::now();
    if output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        write_line_rows(lines, &mut writer)?;
    } else {
        let file = File::create(output)
            .with_context(|| format!("failed to create {}", output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        write_line_rows(lines, &mut writer)?;
        info!("Wrote lines CSV: {}", output.display());
    }
    if args.profile_stages {
        info!(
            "CSV stage: {:.1} ms ({} rows)",
            t_csv.elapsed().as_secs_f64() * 1000.0,
            lines.line_a.len()
        );
    }

    if let Some(json) = args.json.as_ref() {
        let path = if args.all {
            indexed_path(json, idx)
        } else {
            json.clone()
        };
        let text = serde_json::to_string_pretty(dump)?;
        fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote lines JSON: {}", path.display());
    }

    if args.no_plot {
        return Ok(());
    }
    let opts = PlotOptions::default();
    let title = format!("{} + {}", dump.participants[0], dump.participants[1]);
    let mut targets: Vec<(PathBuf, ChartKind)> = Vec::new();
    match args.png.as_ref() {
        Some(path) if args.all => targets.push((indexed_path(path, idx), ChartKind::Png)),
        Some(path) => targets.push((path.clone(), ChartKind::Png)),
        None if output.as_os_str() != "-" => {
            let mut png_path = output.to_path_buf();
            png_path.set_extension("png");
            targets.push((png_path, ChartKind::Png));
        }
        None => {}
    }
    if let Some(path) = args.svg.as_ref() {
        let path = if args.all {
            indexed_path(path, idx)
        } else {
            path.clone()
        };
        targets.push((path, ChartKind::Svg));
    }

    for (path, kind) in targets {
        let t_plot = Instant::now();
        if let Err(err) = render_chart_guard(lines, &title, &path, kind, &opts) {
            warn!("Skipping plot render ({}): {}", path.display(), err);
        } else {
            info!("Wrote plot: {}", path.display());
        }
        if args.profile_stages {
            info!(
                "Plot stage: {:.1} ms",
                t_plot.elapsed().as_secs_f64() * 1000.0
            );
        }
    }
    Ok(())
}

fn indexed_path(base: &Path, idx: usize) -> PathBuf {
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("lines");
    match base.extension().and_then(|s| s.to_str()) {
        Some(ext) => base.with_file_name(format!("{}_{}.{}", stem, idx, ext)),
        None => base.with_file_name(format!("{}_{}", stem, idx)),
    }
}

fn contour_header(curve: &Curve, idx: usize) -> String {
    match curve.label.as_deref() {
        Some(label) => label.to_string(),
        None => format!("contour_{}", idx),
    }
}

fn write_line_rows<W: Write>(lines: &ChatLines, writer: &mut csv::Writer<W>) -> Result<()> {
    let mut header = vec![
        "timestamp".to_string(),
        "time_ms".to_string(),
        lines.line_a.label.clone().unwrap_or_else(|| "a".into()),
        lines.line_b.label.clone().unwrap_or_else(|| "b".into()),
    ];
    header.extend(
        lines
            .contours
            .iter()
            .enumerate()
            .map(|(i, c)| contour_header(c, i)),
    );
    writer.write_record(&header)?;

    for (i, (t, a)) in lines.line_a.points().enumerate() {
        let mut row = vec![
            format_timestamp(t),
            format!("{:.0}", t),
            format!("{:.6}", a),
            lines
                .line_b
                .values
                .get(i)
                .map(|v| format!("{:.6}", v))
                .unwrap_or_default(),
        ];
        for contour in &lines.contours {
            row.push(
                contour
                    .values
                    .get(i)
                    .map(|v| format!("{:.6}", v))
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn format_timestamp(ms: f64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn parse_datetime(input: &str) -> Result<DateTime<Utc>> {
    let trimmed = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(anyhow!("invalid datetime '{}'", trimmed))
}

fn parse_range(input: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (start, end) = input
        .split_once(',')
        .ok_or_else(|| anyhow!("range must be START,END"))?;
    let start = parse_datetime(start)?;
    let end = parse_datetime(end)?;
    if start >= end {
        return Err(anyhow!("range start must precede its end"));
    }
    Ok((start, end))
}

/// Layout of a rendered chart.
#[derive(Clone, Debug)]
struct PlotOptions {
    size: (u32, u32),
    margin: u32,
    show_legend: bool,
}

impl Default for PlotOptions {
    fn default() -> Self {
        Self {
            size: (1500, 800),
            margin: 40,
            show_legend: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum ChartKind {
    Png,
    Svg,
}

fn render_chart_guard(
    lines: &ChatLines,
    title: &str,
    path: &Path,
    kind: ChartKind,
    opts: &PlotOptions,
) -> Result<(), String> {
    let render = || -> Result<(), String> {
        let drawn = match kind {
            ChartKind::Png => {
                let root = BitMapBackend::new(path, opts.size).into_drawing_area();
                draw_chart(root, lines, title, opts)
            }
            ChartKind::Svg => {
                let root = SVGBackend::new(path, opts.size).into_drawing_area();
                draw_chart(root, lines, title, opts)
            }
        };
        drawn.map_err(|e| format!("plotting error: {}", e))
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

fn draw_chart<DB>(
    root: DrawingArea<DB, plotters::coord::Shift>,
    lines: &ChatLines,
    title: &str,
    opts: &PlotOptions,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let origin = lines.line_a.times_ms.first().copied().unwrap_or(0.0);
    let to_days = |t: f64| (t - origin) / MS_PER_DAY;
    let x_max = lines
        .line_a
        .times_ms
        .last()
        .map(|&t| to_days(t))
        .unwrap_or(1.0)
        .max(1e-6);

    let area = root;
    area.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&area)
        .caption(title, FontDesc::new(FontFamily::SansSerif, 26.0, FontStyle::Normal))
        .margin(opts.margin)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(0.0..x_max, 0.0..1.0)?;

    let axis_font = FontDesc::new(FontFamily::SansSerif, 16.0, FontStyle::Normal);
    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .x_desc("days")
        .y_labels(3)
        .y_label_formatter(&|v: &f64| {
            if (v - 0.5).abs() < 1e-9 {
                "50/50".to_string()
            } else {
                String::new()
            }
        })
        .label_style(axis_font.color(&BLACK.mix(0.85)))
        .draw()?;

    let contour_style = ShapeStyle {
        color: RGBColor(128, 128, 128).to_rgba(),
        filled: false,
        stroke_width: 1,
    };
    for contour in &lines.contours {
        let series = chart.draw_series(LineSeries::new(
            contour.points().map(|(t, v)| (to_days(t), v)),
            contour_style,
        ))?;
        if let Some(label) = contour.label.as_deref() {
            series
                .label(label)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], contour_style));
        }
    }

    let palette = [RGBColor(31, 119, 180), RGBColor(255, 127, 14)];
    for (line, color) in [&lines.line_a, &lines.line_b].into_iter().zip(palette) {
        let style = ShapeStyle {
            color: color.to_rgba(),
            filled: false,
            stroke_width: 2,
        };
        chart
            .draw_series(LineSeries::new(
                line.points().map(|(t, v)| (to_days(t), v)),
                style,
            ))?
            .label(line.label.clone().unwrap_or_default())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], style));
    }

    if opts.show_legend {
        chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.7))
            .border_style(&BLACK.mix(0.3))
            .label_font(FontDesc::new(FontFamily::SansSerif, 16.0, FontStyle::Normal).color(&BLACK))
            .position(SeriesLabelPosition::UpperLeft)
            .draw()?;
    }

    area.present()?;
    Ok(())
}
