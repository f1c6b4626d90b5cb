use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::{Config as RlConfig, DefaultEditor};
use toolhub_core::config::AppConfig;
use toolhub_core::Orchestrator;

const BANNER: &str = r#"
  toolhub: chat with tools from your MCP servers

  Type your query and press Enter.
  Commands:
    /tools     List tools by provider
    /servers   List connected providers
    /clear     Forget the conversation so far
    /help      Show this help
    /quit      Quit
"#;

/// Run the interactive REPL until `/quit` or EOF, then close every provider.
pub async fn run(config: &AppConfig, mut orchestrator: Orchestrator) -> Result<()> {
    println!("{}", BANNER);
    println!(
        "  Model: {}  |  Providers: {}  |  Tools: {}",
        config.model.model,
        orchestrator.sessions().len(),
        orchestrator.registry().len()
    );
    println!();

    let rl_config = RlConfig::builder().auto_add_history(true).build();
    let history_path = AppConfig::data_dir().join("repl_history.txt");
    let mut rl = DefaultEditor::with_config(rl_config)?;
    let _ = rl.load_history(&history_path);

    loop {
        match rl.readline("\x1b[1;32mquery ❯\x1b[0m ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }

                if input.starts_with('/') {
                    if !handle_command(input, &mut orchestrator) {
                        break;
                    }
                    continue;
                }

                match orchestrator.process_query(input).await {
                    Ok(response) => println!("\n{}\n", response),
                    Err(e) => eprintln!("\x1b[0;31mError: {}\x1b[0m", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }

    orchestrator.shutdown().await;

    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = rl.save_history(&history_path);

    Ok(())
}

/// Handle a slash command. Returns `true` to continue the loop, `false` to exit.
fn handle_command(input: &str, orchestrator: &mut Orchestrator) -> bool {
    let cmd = input.split_whitespace().next().unwrap_or(input);

    match cmd {
        "/quit" | "/exit" | "/q" => {
            println!("Goodbye!");
            return false;
        }
        "/tools" => print_tools(orchestrator),
        "/servers" => {
            let sessions = orchestrator.sessions();
            if sessions.is_empty() {
                println!("  No providers connected.");
            }
            for (id, session) in sessions.iter() {
                let status = if session.is_alive() {
                    "\x1b[0;32mconnected\x1b[0m"
                } else {
                    "\x1b[0;31mexited\x1b[0m"
                };
                let count = orchestrator.registry().tools_by_session(id).len();
                println!("  {} ({} tools, {})", id, count, status);
            }
        }
        "/clear" => {
            orchestrator.clear_history();
            println!("Cleared conversation history.");
        }
        "/help" | "/?" => {
            println!("  /tools     List tools by provider");
            println!("  /servers   List connected providers");
            println!("  /clear     Forget the conversation so far");
            println!("  /help      Show this help");
            println!("  /quit      Quit");
        }
        _ => {
            println!(
                "Unknown command: {}. Type /help for available commands.",
                cmd
            );
        }
    }

    true
}

/// Print every registered tool grouped by the provider that owns it.
pub fn print_tools(orchestrator: &Orchestrator) {
    let registry = orchestrator.registry();
    if registry.is_empty() {
        println!("  No tools registered.");
        return;
    }

    println!("  Available tools ({}):", registry.len());
    for id in orchestrator.sessions().ids() {
        let tools = registry.tools_by_session(id);
        if tools.is_empty() {
            continue;
        }
        println!("  [{}]", id);
        for tool in tools {
            if tool.description.is_empty() {
                println!("    • {}", tool.name);
            } else {
                println!("    • {}: {}", tool.name, tool.description);
            }
        }
    }
}
