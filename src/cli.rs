use crate::router::Mode;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "odoo-lens",
    version,
    about = "Guarded introspection of a live Odoo runtime",
    after_help = r#"Examples:
  odoo-lens validate --code "import os"
  odoo-lens exec --code "result = env['res.partner'].search_count([])"
  odoo-lens exec --file query.py --page 2 --page-size 50
  odoo-lens index --root /odoo/addons
  odoo-lens index --local --root ./addons
  odoo-lens query --method model_info --params '{"model_name":"sale.order"}' --mode fs
  odoo-lens query --method search_models --params '{"pattern":"partner","limit":10}'
  odoo-lens query --method search_records --params '{"model_name":"sale.order","domain":[["state","=","sale"]]}'
  odoo-lens methods
"#
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

/// Snippet source: inline or from a file.
#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
pub struct SnippetSource {
    #[arg(long)]
    pub code: Option<String>,
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,
}

#[derive(ClapArgs, Debug, Default)]
pub struct PageArgs {
    #[arg(long)]
    pub page: Option<usize>,
    #[arg(long)]
    pub page_size: Option<usize>,
    #[arg(long)]
    pub limit: Option<usize>,
    #[arg(long)]
    pub offset: Option<usize>,
    /// Case-insensitive substring filter.
    #[arg(long)]
    pub filter: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check a snippet against the policy without running it.
    Validate {
        #[command(flatten)]
        source: SnippetSource,
    },
    /// Validate and run a snippet in the live runtime.
    Exec {
        #[command(flatten)]
        source: SnippetSource,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Build the static model index and print it.
    Index {
        /// Source root to scan; repeatable. Defaults to ODOO_ADDONS_PATH.
        #[arg(long = "root")]
        roots: Vec<String>,
        /// Parse a local checkout instead of scanning inside the container.
        #[arg(long)]
        local: bool,
    },
    /// Answer one named query.
    Query {
        /// model_info | search_models | search_decorators | search_count | search_records | execute
        #[arg(long)]
        method: String,
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, value_name = "PATH")]
        params_file: Option<PathBuf>,
        /// Backend: auto|fs|registry.
        #[arg(long, value_enum, default_value_t = Mode::Auto)]
        mode: Mode,
    },
    /// List query methods with their parameter schemas.
    Methods,
}
