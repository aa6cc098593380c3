//! stacklink cli interface

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Resource type schema (YAML or JSON)
    #[clap(short = 's', long = "schema", global(true))]
    pub schema: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse a template and print its resource graph
    ///
    /// Reads the template from stdin unless --template is given
    Parse(ParseCommand),

    /// Apply a change to a template and print the resulting template
    Apply(ApplyCommand),

    /// Print debug information for development
    Dev(DevCommand),
}

#[derive(Parser, Debug)]
pub struct ParseCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub output: OutputArgs,

    /// Print the ownership map instead of the graph
    #[clap(long = "owners")]
    pub owners: bool,
}

#[derive(Parser, Debug)]
pub struct ApplyCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub output: OutputArgs,

    /// File holding one intent (YAML or JSON), e.g. `{Action: DeleteResource, ResourceId: Tbl}`
    #[clap(short = 'i', long = "intent")]
    pub intent: PathBuf,
}

#[derive(Parser, Debug)]
pub struct InputArgs {
    /// Load the template from a file
    #[clap(short = 't', long = "template")]
    pub template: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    #[arg(short = 'F', long = "output-format", default_value_t)]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum OutputFormat {
    Json,
    #[default]
    Yaml,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => f.write_str("json"),
            OutputFormat::Yaml => f.write_str("yaml"),
        }
    }
}

#[derive(Parser, Debug)]
pub struct DevCommand {
    #[command(subcommand)]
    pub command: DevSubCommand,
}

#[derive(Subcommand, Debug)]
pub enum DevSubCommand {
    /// Dump the loaded schema registry
    Schema,
    /// Dump the loaded template with short-form tags expanded
    Template(InputArgs),
}
