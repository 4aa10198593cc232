//! safepy CLI - evaluate a safe subset of Python

use std::io::Read;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context as _};
use clap::Parser;

use safepy::cli::{parse_var, Args, SubCommand};
use safepy::output::{format_error, format_output, OutputFormat};
use safepy::parser::parse_program;
use safepy::script::Executor;
use safepy::telemetry;

fn main() -> ExitCode {
    let args = Args::parse();
    telemetry::init_tracing(args.log_json, telemetry::level_for(args.verbose));

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    let config = args
        .executor_config()
        .context("failed to load configuration")?;
    let mut executor = Executor::with_config(&args.allow_imports, config);

    let mut variables = Vec::new();
    for raw in &args.vars {
        match parse_var(raw) {
            Some(pair) => variables.push(pair),
            None => bail!("--var expects KEY=VALUE, got '{}'", raw),
        }
    }
    executor.define_variables(variables)?;

    match args.command {
        SubCommand::Exec { code } => {
            let source = if code == "-" {
                let mut buffer = String::new();
                std::io::stdin()
                    .read_to_string(&mut buffer)
                    .context("failed to read stdin")?;
                buffer
            } else {
                code
            };
            Ok(execute(&mut executor, &source, &format))
        }

        SubCommand::Run { file } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            Ok(execute(&mut executor, &source, &format))
        }

        SubCommand::Check { input, ast } => {
            let path = Path::new(&input);
            let source = if path.is_file() {
                std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?
            } else {
                input.clone()
            };

            match executor.check(&source) {
                Ok(warnings) => {
                    for warning in &warnings {
                        eprintln!("{}", warning);
                    }
                    if ast {
                        let program = parse_program(&source)?;
                        println!("{}", serde_json::to_string_pretty(&program)?);
                    } else {
                        println!("OK ({} warnings)", warnings.len());
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    print!("{}", format_error(&e, "", &format));
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        SubCommand::Imports => {
            let modules = executor.list_allowed_imports();
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&modules)?),
                OutputFormat::Human => {
                    for module in modules {
                        println!("{}", module);
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        SubCommand::Repl => {
            safepy::repl::run_repl(executor)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run one source unit and print its result; failures exit with status 1
fn execute(executor: &mut Executor, source: &str, format: &OutputFormat) -> ExitCode {
    match executor.execute(source) {
        Ok(result) => {
            print!("{}", format_output(&result, format));
            if *format == OutputFormat::Json {
                println!();
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            print!("{}", format_error(&e, &executor.last_logs(), format));
            if *format == OutputFormat::Json {
                println!();
            }
            ExitCode::FAILURE
        }
    }
}
