pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::job::Tone;
use crate::llm::ProviderKind;

#[derive(Parser)]
#[command(name = "longtrans")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Long-form document translation pipeline driven by LLMs", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Workspace directory for the local job and object stores
    #[arg(long, global = true, env = "LONGTRANS_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long, default_value = "false")]
        force: bool,
    },

    /// Translate a plain-text document end to end
    #[command(long_about = "Translate a plain-text document end to end.\n\n\
        The document is chunked into token-bounded pieces, translated chunk \n\
        by chunk under the configured rate limits, and reassembled in order.\n\
        Supported providers: anthropic, openai. Both accept a custom base_url\n\
        in the config file, so proxies and compatible gateways work too.")]
    Translate {
        /// Path to the source document (.txt, UTF-8)
        #[arg(required = true)]
        file: PathBuf,

        /// Target language tag (BCP-47-like, e.g. de, pt-BR, zh-Hant)
        #[arg(short, long, env = "LONGTRANS_LANGUAGE")]
        language: String,

        /// Tone of the translated output
        #[arg(short, long, default_value = "neutral")]
        tone: ToneArg,

        /// LLM provider (anthropic, openai)
        #[arg(short, long, env = "LONGTRANS_PROVIDER")]
        provider: Option<LlmProvider>,

        /// Model name (provider-specific, e.g. claude-sonnet-4-20250514, gpt-4o)
        #[arg(short, long, env = "LONGTRANS_MODEL")]
        model: Option<String>,

        /// Number of chunks translated in parallel (1-20)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Where to write the translated document (defaults next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the status of a translation job
    Status {
        /// Job identifier
        job_id: String,
    },

    /// List translation jobs, newest first
    Jobs,

    /// Resume an interrupted job from its last durable state
    Resume {
        /// Job identifier
        job_id: String,

        /// LLM provider (anthropic, openai)
        #[arg(short, long, env = "LONGTRANS_PROVIDER")]
        provider: Option<LlmProvider>,

        /// Model name override
        #[arg(short, long, env = "LONGTRANS_MODEL")]
        model: Option<String>,
    },

    /// Reset a failed job to uploaded, deleting its artifacts
    Reset {
        /// Job identifier
        job_id: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum LlmProvider {
    #[default]
    Anthropic,
    OpenAI,
}

impl From<LlmProvider> for ProviderKind {
    fn from(provider: LlmProvider) -> Self {
        match provider {
            LlmProvider::Anthropic => ProviderKind::Anthropic,
            LlmProvider::OpenAI => ProviderKind::OpenAi,
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::Anthropic => write!(f, "anthropic"),
            LlmProvider::OpenAI => write!(f, "openai"),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum ToneArg {
    Formal,
    Informal,
    #[default]
    Neutral,
}

impl From<ToneArg> for Tone {
    fn from(tone: ToneArg) -> Self {
        match tone {
            ToneArg::Formal => Tone::Formal,
            ToneArg::Informal => Tone::Informal,
            ToneArg::Neutral => Tone::Neutral,
        }
    }
}

impl std::fmt::Display for ToneArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToneArg::Formal => write!(f, "formal"),
            ToneArg::Informal => write!(f, "informal"),
            ToneArg::Neutral => write!(f, "neutral"),
        }
    }
}
