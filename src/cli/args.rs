//! CLI argument parsing

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ExecutorConfig, Limits};

#[derive(Parser, Debug)]
#[command(name = "safepy")]
#[command(author, version, about = "Evaluate a safe subset of Python in a sandbox", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: SubCommand,

    /// Allow importing a module on top of the built-in list (repeatable)
    #[arg(long = "allow-import", value_name = "MODULE", global = true, env = "SAFEPY_ALLOW_IMPORTS", value_delimiter = ',')]
    pub allow_imports: Vec<String>,

    /// Inject a variable, the value is parsed as JSON (plain text otherwise)
    #[arg(long = "var", value_name = "KEY=JSON", global = true)]
    pub vars: Vec<String>,

    /// JSON config file with allowed imports, limits and random seed
    #[arg(long, value_name = "FILE", global = true, env = "SAFEPY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output (debug logs on stderr)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "SAFEPY_LOG_JSON")]
    pub log_json: bool,

    #[command(flatten)]
    pub limits: LimitArgs,
}

/// Overrides for the evaluation budgets
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct LimitArgs {
    /// Evaluation steps per execution
    #[arg(long, value_name = "N", global = true, env = "SAFEPY_MAX_OPERATIONS")]
    pub max_operations: Option<u64>,

    /// Iterations of a single while loop
    #[arg(long, value_name = "N", global = true, env = "SAFEPY_MAX_WHILE_ITERATIONS")]
    pub max_while_iterations: Option<u64>,

    /// Nested function calls
    #[arg(long, value_name = "N", global = true, env = "SAFEPY_MAX_CALL_DEPTH")]
    pub max_call_depth: Option<usize>,

    /// Characters of captured print output
    #[arg(long, value_name = "N", global = true, env = "SAFEPY_MAX_OUTPUT_LEN")]
    pub max_output_len: Option<usize>,

    /// Seed for the random module
    #[arg(long, value_name = "SEED", global = true, env = "SAFEPY_SEED")]
    pub seed: Option<u64>,
}

impl LimitArgs {
    fn apply(&self, limits: &mut Limits) {
        if let Some(n) = self.max_operations {
            limits.max_operations = n;
        }
        if let Some(n) = self.max_while_iterations {
            limits.max_while_iterations = n;
        }
        if let Some(n) = self.max_call_depth {
            limits.max_call_depth = n;
        }
        if let Some(n) = self.max_output_len {
            limits.max_output_len = n;
        }
    }
}

impl Args {
    /// Config file (or defaults) with command line overrides applied
    pub fn executor_config(&self) -> crate::error::Result<ExecutorConfig> {
        let mut config = match &self.config {
            Some(path) => ExecutorConfig::from_file(path)?,
            None => ExecutorConfig::default(),
        };
        self.limits.apply(&mut config.limits);
        if self.limits.seed.is_some() {
            config.random_seed = self.limits.seed;
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum SubCommand {
    /// Evaluate a snippet given on the command line ("-" reads stdin)
    Exec {
        /// The source code to evaluate
        code: String,
    },

    /// Evaluate a source file
    Run {
        /// Path to the file
        file: PathBuf,
    },

    /// Restrict a file or snippet without running it
    Check {
        /// Source code or path to a file
        input: String,

        /// Print the parsed syntax tree as JSON
        #[arg(long)]
        ast: bool,
    },

    /// List the modules evaluated code may import
    Imports,

    /// Start interactive REPL mode
    Repl,
}

/// Split a `--var` argument into a name and a value
pub fn parse_var(raw: &str) -> Option<(String, serde_json::Value)> {
    let (key, value) = raw.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Some((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_json_and_text() {
        let (key, value) = parse_var("n=[1, 2]").unwrap();
        assert_eq!(key, "n");
        assert_eq!(value, serde_json::json!([1, 2]));

        let (_, text) = parse_var("name=alice").unwrap();
        assert_eq!(text, serde_json::json!("alice"));

        let (_, eq) = parse_var("expr=a=b").unwrap();
        assert_eq!(eq, serde_json::json!("a=b"));

        assert!(parse_var("novalue").is_none());
        assert!(parse_var("=1").is_none());
    }

    #[test]
    fn test_limit_flags_override_config() {
        let args = Args::parse_from([
            "safepy",
            "--max-operations",
            "500",
            "--seed",
            "3",
            "exec",
            "1",
        ]);
        let config = args.executor_config().unwrap();
        assert_eq!(config.limits.max_operations, 500);
        assert_eq!(config.random_seed, Some(3));
        assert_eq!(
            config.limits.max_while_iterations,
            crate::config::DEFAULT_MAX_WHILE_ITERATIONS
        );
    }

    #[test]
    fn test_allow_import_repeats() {
        let args = Args::parse_from([
            "safepy",
            "exec",
            "1",
            "--allow-import",
            "statistics",
            "--allow-import",
            "copy",
        ]);
        assert_eq!(args.allow_imports, vec!["statistics", "copy"]);
    }
}
