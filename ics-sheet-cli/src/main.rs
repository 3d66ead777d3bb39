mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ics-sheet")]
#[command(about = "Render iCalendar feeds as printable calendar sheets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 启用详细日志
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Date window: `--from/--to` or `--year/--month`, the current month otherwise.
#[derive(Args, Debug, Clone, Default)]
pub struct WindowArgs {
    /// Window start (RFC 3339 or YYYY-MM-DD)
    #[arg(long, requires = "to")]
    pub from: Option<String>,

    /// Window end, exclusive
    #[arg(long, requires = "from")]
    pub to: Option<String>,

    /// Year of a whole-month window
    #[arg(long, requires = "month", conflicts_with = "from")]
    pub year: Option<i32>,

    /// Month (1-12) of a whole-month window
    #[arg(long, requires = "year", conflicts_with = "from")]
    pub month: Option<u32>,

    /// Display time zone (IANA name)
    #[arg(long, default_value = "UTC")]
    pub tz: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Html,
    Pdf,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Render feeds into an HTML, PDF or JSON sheet
    Render {
        /// Feed files or URLs, optionally named: `Family=https://…/basic.ics`
        #[arg(required = true)]
        inputs: Vec<String>,

        #[command(flatten)]
        window: WindowArgs,

        /// Grid period: daily, weekly or monthly
        #[arg(short, long, default_value = "daily")]
        period: String,

        /// Entries shown per cell, 0 for unlimited
        #[arg(short, long, default_value = "0")]
        capacity: usize,

        /// Calendar color: `Family=#0B8043`
        #[arg(long = "color")]
        colors: Vec<String>,

        #[arg(short, long, value_enum, default_value = "html")]
        format: Format,

        /// 输出文件路径, `-` for stdout
        #[arg(short, long)]
        output: Option<String>,

        /// HTML → PDF converter reading stdin and writing stdout
        #[arg(long, default_value = "weasyprint - -")]
        pdf_command: String,

        /// Converter timeout in seconds
        #[arg(long, default_value = "60")]
        pdf_timeout: u64,
    },

    /// Print the ordered occurrences of feeds
    Occurrences {
        /// Feed files or URLs, optionally named
        #[arg(required = true)]
        inputs: Vec<String>,

        #[command(flatten)]
        window: WindowArgs,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 设置日志级别
    let log_level = if cli.verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("ics_sheet_cli={0},ics_sheet_core={0}", log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Render {
            inputs,
            window,
            period,
            capacity,
            colors,
            format,
            output,
            pdf_command,
            pdf_timeout,
        } => {
            commands::render_command(commands::RenderParams {
                inputs,
                window,
                period,
                capacity,
                colors,
                format,
                output,
                pdf_command,
                pdf_timeout,
            })
            .await
        }

        Commands::Occurrences {
            inputs,
            window,
            json,
        } => commands::occurrences_command(inputs, window, json).await,
    }
}
