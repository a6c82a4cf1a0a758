use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "slidecast")]
#[command(author, version, about = "Turn documents into narrated slide videos")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a video from a document
    Generate(GenerateArgs),

    /// Generate a short preview: no avatar and at most a few segments
    Preview {
        /// Document to read (.txt or .md)
        #[arg(required = true)]
        document: PathBuf,

        /// Provider whose capability bindings to use
        #[arg(short, long, default_value = "default")]
        provider: String,

        /// Maximum number of segments
        #[arg(short = 'n', long, default_value = "2")]
        max_segments: usize,

        /// Slide theme
        #[arg(long)]
        theme: Option<String>,

        /// Output file name inside the output directory
        #[arg(short, long, default_value = "preview.mp4")]
        output: String,
    },

    /// Show the capability order each stage would use
    Providers {
        /// Provider to resolve (lists configured providers if omitted)
        provider: Option<String>,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Args)]
pub struct GenerateArgs {
    /// Document to read (.txt or .md)
    #[arg(required = true)]
    pub document: PathBuf,

    /// Provider whose capability bindings to use
    #[arg(short, long, default_value = "default")]
    pub provider: String,

    /// Maximum number of segments
    #[arg(short = 'n', long)]
    pub max_segments: Option<usize>,

    /// Slide theme
    #[arg(long)]
    pub theme: Option<String>,

    /// Face image for the presenter avatar
    #[arg(long, conflicts_with = "no_avatar")]
    pub avatar: Option<PathBuf>,

    /// Skip the avatar stage
    #[arg(long)]
    pub no_avatar: bool,

    /// Voice selector passed to speech capabilities
    #[arg(long)]
    pub voice: Option<String>,

    /// Narration depth
    #[arg(long, value_enum, default_value = "standard")]
    pub detail: Detail,

    /// Output file name inside the output directory
    #[arg(short, long, default_value = "video.mp4")]
    pub output: String,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Detail {
    Standard,
    Intelligent,
}
