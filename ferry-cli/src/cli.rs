use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use ferry_engine::VariantPolicy;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "ferry", version, about = "Relay live or recorded media into a chunked-upload endpoint")]
pub struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload a manifest or a local file to an upload endpoint
    Upload(UploadArgs),
}

#[derive(ClapArgs, Debug)]
pub struct UploadArgs {
    /// Upload endpoint (ws:// or wss://)
    #[arg(long)]
    pub endpoint: Url,

    /// HLS playlist to follow
    #[arg(long, conflicts_with = "input", required_unless_present = "input")]
    pub manifest: Option<Url>,

    /// Local file to upload
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Name announced to the server (defaults to the input's file name)
    #[arg(long)]
    pub file_name: Option<String>,

    /// Total size announced to the server (defaults to the input file's size)
    #[arg(long)]
    pub total_size: Option<u64>,

    /// Seconds of media to skip from the start of the playlist
    #[arg(long, default_value_t = 0.0)]
    pub start_offset: f64,

    /// Stop after this many seconds of media
    #[arg(long)]
    pub max_duration: Option<f64>,

    /// Variant to follow when the manifest is a master playlist
    #[arg(long, value_enum, default_value_t = VariantArg::Highest)]
    pub variant: VariantArg,

    /// Relay capacity in bytes
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    pub relay_capacity: usize,

    /// Copy every relayed byte to this file
    #[arg(long)]
    pub mirror: Option<PathBuf>,

    /// Client-side cap on the negotiated buffer size
    #[arg(long)]
    pub max_buffer_size: Option<usize>,

    /// Access token for the endpoint
    #[arg(long, env = "FERRY_TOKEN", conflicts_with = "auth_url")]
    pub token: Option<String>,

    /// Send the credential as this query parameter instead of a bearer header
    #[arg(long)]
    pub token_query: Option<String>,

    /// Login endpoint returning a token
    #[arg(long, requires_all = ["username", "password"])]
    pub auth_url: Option<Url>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long, env = "FERRY_PASSWORD")]
    pub password: Option<String>,

    /// Extra HTTP header for manifest and segment requests (`Name: value`)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Extra query parameter for manifest and segment requests (`key=value`)
    #[arg(long = "param")]
    pub params: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum VariantArg {
    Highest,
    Lowest,
    Audio,
}

impl From<VariantArg> for VariantPolicy {
    fn from(value: VariantArg) -> Self {
        match value {
            VariantArg::Highest => VariantPolicy::HighestBandwidth,
            VariantArg::Lowest => VariantPolicy::LowestBandwidth,
            VariantArg::Audio => VariantPolicy::AudioOnly,
        }
    }
}
