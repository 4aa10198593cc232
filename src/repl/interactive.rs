//! Interactive REPL implementation

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::error::{Result, SafepyError};
use crate::output::{format_error, format_output, OutputFormat};
use crate::script::Executor;

pub fn run_repl(mut executor: Executor) -> Result<()> {
    let mut rl = DefaultEditor::new()
        .map_err(|e| SafepyError::Io(std::io::Error::other(e.to_string())))?;

    println!("safepy v{} - Interactive Mode", env!("CARGO_PKG_VERSION"));
    println!("Type ':help' for commands, ':quit' to exit\n");

    // Lines of a block statement waiting for its terminating blank line
    let mut input_buffer = String::new();

    loop {
        let prompt = if input_buffer.is_empty() { ">>> " } else { "... " };

        match rl.readline(prompt) {
            Ok(line) => {
                if input_buffer.is_empty() {
                    let command = line.trim();
                    if command.is_empty() {
                        continue;
                    }
                    if command.starts_with(':') {
                        if !repl_command(command, &mut executor) {
                            break;
                        }
                        continue;
                    }
                }

                let _ = rl.add_history_entry(line.as_str());

                if !input_buffer.is_empty() && line.trim().is_empty() {
                    let source = std::mem::take(&mut input_buffer);
                    evaluate(&mut executor, &source);
                    continue;
                }

                input_buffer.push_str(&line);
                input_buffer.push('\n');

                if !opens_block(&input_buffer) {
                    let source = std::mem::take(&mut input_buffer);
                    evaluate(&mut executor, &source);
                }
            }
            Err(ReadlineError::Interrupted) => {
                if input_buffer.is_empty() {
                    println!("^C");
                } else {
                    println!("^C (input cancelled)");
                    input_buffer.clear();
                }
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// A buffer that started a compound statement keeps reading lines until a
/// blank one
fn opens_block(buffer: &str) -> bool {
    let first = buffer.lines().next().unwrap_or("");
    first.trim_end().ends_with(':') || first.trim_start().starts_with('@')
}

fn evaluate(executor: &mut Executor, source: &str) {
    match executor.execute(source) {
        Ok(result) => {
            let output = format_output(&result, &OutputFormat::Human);
            if !output.is_empty() {
                print!("{}", output);
            }
        }
        Err(e) => {
            eprint!(
                "{}",
                format_error(&e, &executor.last_logs(), &OutputFormat::Human)
            );
        }
    }
}

/// Handle a `:command`; returns false when the REPL should stop
fn repl_command(command: &str, executor: &mut Executor) -> bool {
    match command {
        ":quit" | ":exit" | ":q" => {
            println!("Goodbye!");
            return false;
        }
        ":help" | ":?" => print_help(),
        ":vars" => print!("{}", executor.describe()),
        ":imports" => println!("{}", executor.list_allowed_imports().join(", ")),
        ":reset" => {
            executor.reset();
            println!("Bindings cleared");
        }
        ":clear" => print!("\x1B[2J\x1B[1;1H"),
        other => eprintln!("Unknown command '{}', try :help", other),
    }
    true
}

fn print_help() {
    println!(
        r#"
safepy REPL
===========

Type Python statements; the value of the last one is printed.
Blocks ending with ':' continue until a blank line.

  :help, :?        Show this help
  :vars            Show variables and tools
  :imports         List importable modules
  :reset           Drop variables created in this session
  :clear           Clear screen
  :quit, :q        Exit the REPL
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_detection() {
        assert!(opens_block("for i in range(3):\n"));
        assert!(opens_block("def f(x):  \n    return x\n"));
        assert!(!opens_block("x = {'a': 1}\n"));
        assert!(!opens_block("print('done')\n"));
    }

    #[test]
    fn test_repl_commands() {
        let mut executor = Executor::default();
        executor.execute("x = 1").unwrap();
        assert!(repl_command(":reset", &mut executor));
        assert!(executor.variable("x").is_none());
        assert!(!repl_command(":quit", &mut executor));
        assert!(repl_command(":nope", &mut executor));
    }
}
