mod commands;
mod context;
mod output;
mod theme;

use std::{fmt::Write, path::PathBuf};

use anyhow::Result;
use clap::{
    ColorChoice, Command, CommandFactory, FromArgMatches, Parser, Subcommand,
    builder::{
        Styles,
        styling::{AnsiColor, Color as ClapColor, RgbColor, Style},
    },
};
use colored::{Color as ThemeColor, Colorize, control::ShouldColorize};

use commands::{
    CASCADE_EXAMPLES, EntityArgs, HistoryArgs, LINK_EXAMPLES, LIST_EXAMPLES, ListArgs, PairArgs, ValidateArgs,
};
use context::CliContext;
use output::{GlobalOptions, OutputFormat, OutputManager};
use theme::{ICONS, THEME};

const ENVIRONMENT_VARIABLES: &[(&str, &str)] = &[
    ("REDIS_URL", "Redis connection URL used when [redis] url is \"${REDIS_URL}\""),
    ("FLEETLINK_CONFIG", "Path to the engine configuration file"),
    ("FLEETLINK_ACTOR", "Default value of --by"),
    ("RUST_LOG", "Log filter, e.g. fleetlink=debug"),
];

#[derive(Parser)]
#[command(name = "fleetlink")]
#[command(version)]
#[command(
    about = "Link, unlink and audit fleet entity associations",
    long_about = r#"Operator CLI for the fleet association engine:

• Link and unlink devices, installations, contacts and SIM cards
• Browse associations and their append-only history
• Cascade-delete, soft-delete and restore entities
"#
)]
#[command(subcommand_required = true, arg_required_else_help = true)]
struct Cli {
    /// Engine configuration file (defaults to ./fleetlink.toml when present)
    #[arg(long, global = true, env = "FLEETLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Suppress output (only errors will be shown)
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an association between two entities
    Link(PairArgs),

    /// Remove the association between two entities
    Unlink(PairArgs),

    /// List an entity's associations
    List(ListArgs),

    /// Show an entity's link/unlink history, newest first
    History(HistoryArgs),

    /// Delete an entity and every association referencing it
    CascadeDelete(EntityArgs),

    /// Mark an entity and its associations inactive
    SoftDelete(EntityArgs),

    /// Reactivate a soft-deleted entity
    Restore(EntityArgs),

    /// Check that entities exist and are active
    Validate(ValidateArgs),
}

fn build_cli_command() -> Command {
    let use_color = ShouldColorize::from_env().should_colorize();
    let mut command = Cli::command()
        .after_long_help(render_top_level_appendix(use_color))
        .color(if use_color { ColorChoice::Auto } else { ColorChoice::Never })
        .styles(help_styles());

    for (name, examples) in [
        ("link", LINK_EXAMPLES),
        ("list", LIST_EXAMPLES),
        ("cascade-delete", CASCADE_EXAMPLES),
    ] {
        if let Some(subcommand) = command.find_subcommand_mut(name) {
            *subcommand = subcommand.clone().after_long_help(render_examples(examples, use_color));
        }
    }
    command
}

fn render_examples(examples: &[&str], use_color: bool) -> String {
    let mut buffer = String::new();
    let _ = writeln!(buffer, "{}", stylize("Examples:", THEME.highlight, true, use_color));
    for example in examples {
        let arrow = stylize(ICONS.arrow, THEME.secondary, false, use_color);
        let _ = writeln!(buffer, "  {arrow} {}", stylize(example, THEME.secondary, false, use_color));
    }
    buffer
}

fn render_top_level_appendix(use_color: bool) -> String {
    let mut buffer = String::new();
    let _ = writeln!(buffer, "{}", stylize("Environment Variables:", THEME.highlight, true, use_color));
    for (key, description) in ENVIRONMENT_VARIABLES {
        let key_text = stylize(key, THEME.key, true, use_color);
        let value_text = stylize(description, THEME.value, false, use_color);
        let _ = writeln!(buffer, "  {key_text}  {value_text}");
    }
    buffer
}

fn stylize(text: &str, color: ThemeColor, bold: bool, use_color: bool) -> String {
    if !use_color {
        return text.to_string();
    }
    let styled = text.color(color);
    if bold { styled.bold().to_string() } else { styled.to_string() }
}

fn help_styles() -> Styles {
    let theme = &THEME;
    Styles::styled()
        .usage(style_from_color(theme.primary).bold())
        .header(style_from_color(theme.highlight).bold())
        .literal(style_from_color(theme.secondary))
        .placeholder(style_from_color(theme.muted))
        .valid(style_from_color(theme.success))
        .invalid(style_from_color(theme.warning))
        .error(style_from_color(theme.error).bold())
}

fn style_from_color(color: ThemeColor) -> Style {
    Style::new().fg_color(Some(color_to_clap_color(color)))
}

fn color_to_clap_color(color: ThemeColor) -> ClapColor {
    match color {
        ThemeColor::Black => ClapColor::Ansi(AnsiColor::Black),
        ThemeColor::Red => ClapColor::Ansi(AnsiColor::Red),
        ThemeColor::Green => ClapColor::Ansi(AnsiColor::Green),
        ThemeColor::Yellow => ClapColor::Ansi(AnsiColor::Yellow),
        ThemeColor::Blue => ClapColor::Ansi(AnsiColor::Blue),
        ThemeColor::Magenta => ClapColor::Ansi(AnsiColor::Magenta),
        ThemeColor::Cyan => ClapColor::Ansi(AnsiColor::Cyan),
        ThemeColor::White => ClapColor::Ansi(AnsiColor::White),
        ThemeColor::BrightBlack => ClapColor::Ansi(AnsiColor::BrightBlack),
        ThemeColor::BrightRed => ClapColor::Ansi(AnsiColor::BrightRed),
        ThemeColor::BrightGreen => ClapColor::Ansi(AnsiColor::BrightGreen),
        ThemeColor::BrightYellow => ClapColor::Ansi(AnsiColor::BrightYellow),
        ThemeColor::BrightBlue => ClapColor::Ansi(AnsiColor::BrightBlue),
        ThemeColor::BrightMagenta => ClapColor::Ansi(AnsiColor::BrightMagenta),
        ThemeColor::BrightCyan => ClapColor::Ansi(AnsiColor::BrightCyan),
        ThemeColor::BrightWhite => ClapColor::Ansi(AnsiColor::BrightWhite),
        ThemeColor::TrueColor { r, g, b } => ClapColor::Rgb(RgbColor(r, g, b)),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = build_cli_command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(err) => err.exit(),
    };

    let output = OutputManager::new(GlobalOptions {
        output_format: cli.output.clone(),
        quiet: cli.quiet,
        no_color: cli.no_color,
    });

    if let Err(err) = execute(cli, &output).await {
        output.error(&format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn execute(cli: Cli, output: &OutputManager) -> Result<()> {
    let context = CliContext::load(cli.config.as_deref())?;
    if let Some(path) = &context.config_path {
        log::debug!("loaded configuration from {}", path.display());
    }
    let engine = context.engine().await?;

    match cli.command {
        Commands::Link(args) => commands::handle_link(&engine, args, output).await,
        Commands::Unlink(args) => commands::handle_unlink(&engine, args, output).await,
        Commands::List(args) => commands::handle_list(&engine, args, output).await,
        Commands::History(args) => commands::handle_history(&engine, args, output).await,
        Commands::CascadeDelete(args) => commands::handle_cascade_delete(&engine, args, output).await,
        Commands::SoftDelete(args) => commands::handle_soft_delete(&engine, args, output).await,
        Commands::Restore(args) => commands::handle_restore(&engine, args, output).await,
        Commands::Validate(args) => commands::handle_validate(&engine, args, output).await,
    }
}
