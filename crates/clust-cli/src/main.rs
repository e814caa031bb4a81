use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use clust_runner::{
    load_engine_config, load_run_definition, read_run_results, Context, EngineConfig, Registry,
    Run, RunKind, RunResult,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clust", version = "0.3.0", about = "Clustering evaluation runner")]
struct Cli {
    #[arg(long, global = true, help = "debug-level logs unless RUST_LOG is set")]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug, Default)]
struct EngineArgs {
    #[arg(long)]
    engine: Option<PathBuf>,
    #[arg(long)]
    results: Option<PathBuf>,
    #[arg(long)]
    run_threads: Option<usize>,
    #[arg(long)]
    iteration_threads: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        definition: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
        #[arg(long)]
        json: bool,
    },
    Resume {
        run_id: String,
        #[command(flatten)]
        engine: EngineArgs,
        #[arg(long)]
        json: bool,
    },
    Describe {
        definition: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Results {
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            definition,
            engine,
            json,
        } => {
            let config = engine_config(&engine)?;
            let def = load_run_definition(&definition)?;
            let ctx = Context::new(config)?;
            let run = Run::new(ctx.clone(), def)?;
            let outcome = run.perform();
            ctx.shutdown();
            outcome?;
            finish_run(&run, json)
        }
        Commands::Resume {
            run_id,
            engine,
            json,
        } => {
            let config = engine_config(&engine)?;
            let ctx = Context::new(config)?;
            let run = Run::from_result_folder(ctx.clone(), &run_id)?;
            let outcome = run.resume(&run_id);
            ctx.shutdown();
            outcome?;
            finish_run(&run, json)
        }
        Commands::Describe { definition, json } => {
            let def = load_run_definition(&definition)?;
            let registry = Registry::with_builtins(Duration::from_millis(
                EngineConfig::default().process_poll_ms,
            ));
            def.validate()?;
            let kind = RunKind::from_definition(&def, &registry)?;
            let mut tasks = Vec::new();
            for index in 0..kind.number_of_tasks() {
                tasks.push(json!({
                    "label": kind.task_label(index).unwrap_or_default(),
                    "iterations": kind.iterations_per_task(index, &registry)?,
                }));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "name": def.name,
                    "mode": def.mode.as_str(),
                    "tasks": tasks,
                })));
            }
            println!("name: {}", def.name);
            println!("mode: {}", def.mode.as_str());
            println!("tasks: {}", tasks.len());
            for task in &tasks {
                println!(
                    "task: {} iterations={}",
                    task["label"].as_str().unwrap_or(""),
                    task["iterations"]
                );
            }
            Ok(None)
        }
        Commands::Results { run_dir, json } => {
            let registry = Registry::with_builtins(Duration::from_millis(
                EngineConfig::default().process_poll_ms,
            ));
            let results = read_run_results(&registry, &run_dir)?;
            let payload = results_json(&results);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "results",
                    "run_dir": run_dir.display().to_string(),
                    "results": payload,
                })));
            }
            println!("run_dir: {}", run_dir.display());
            print_results(&results);
            Ok(None)
        }
    }
}

fn engine_config(args: &EngineArgs) -> Result<EngineConfig> {
    let mut config = match &args.engine {
        Some(path) => load_engine_config(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &args.results {
        config.result_root = root.clone();
    }
    if let Some(n) = args.run_threads {
        config.run_threads = n;
    }
    if let Some(n) = args.iteration_threads {
        config.iteration_threads = n;
    }
    if config.run_threads == 0 || config.iteration_threads == 0 {
        return Err(anyhow!("invalid_engine_config: thread counts must be positive"));
    }
    Ok(config)
}

fn finish_run(run: &Run, json: bool) -> Result<Option<Value>> {
    let results = run.results();
    let errors = run.task_errors();
    let run_dir = run.layout().map(|l| l.root.display().to_string());
    info!(
        run = ?run.run_id(),
        status = run.status().as_str(),
        results = results.len(),
        errors = errors.len(),
        "run outcome"
    );
    if json {
        return Ok(Some(json!({
            "ok": true,
            "run_id": run.run_id(),
            "run_dir": run_dir,
            "status": run.status(),
            "percent_finished": run.percent_finished(),
            "results": results_json(&results),
            "errors": errors,
            "stale_configs": run.stale_configs(),
        })));
    }
    println!("run_id: {}", run.run_id().unwrap_or_default());
    if let Some(dir) = run_dir {
        println!("run_dir: {}", dir);
    }
    println!("status: {}", run.status().as_str());
    println!("percent_finished: {:.1}", run.percent_finished());
    print_results(&results);
    for err in errors {
        println!("error: {}", err.replace('\n', "\n       "));
    }
    Ok(None)
}

fn results_json(results: &[RunResult]) -> Value {
    let items: Vec<Value> = results
        .iter()
        .map(|result| match result {
            RunResult::Pair(pair) => {
                let optima: Vec<Value> = pair
                    .ranked_optima()
                    .into_iter()
                    .map(|(measure, opt)| {
                        json!({
                            "measure": measure,
                            "parameters": opt.parameters,
                            "value": opt.value,
                            "iteration": opt.iteration,
                        })
                    })
                    .collect();
                json!({
                    "kind": "pair",
                    "program": pair.program,
                    "data": pair.data,
                    "rows": pair.file.records.len(),
                    "completed": pair.file.completed_count(),
                    "resumed": pair.resumed,
                    "criterion": pair.criterion,
                    "optima": optima,
                })
            }
            RunResult::Analysis(analysis) => json!({
                "kind": "analysis",
                "target": analysis.target,
                "statistics": analysis.statistics,
            }),
        })
        .collect();
    Value::Array(items)
}

fn print_results(results: &[RunResult]) {
    for result in results {
        match result {
            RunResult::Pair(pair) => {
                println!(
                    "pair: {}_{} rows={} completed={}{}",
                    pair.program,
                    pair.data,
                    pair.file.records.len(),
                    pair.file.completed_count(),
                    if pair.resumed { " (resumed)" } else { "" }
                );
                for (measure, opt) in pair.ranked_optima() {
                    let mark = if pair.criterion.as_deref() == Some(measure) {
                        " (criterion)"
                    } else {
                        ""
                    };
                    println!(
                        "  optimum: {}={} at iteration {} {}{}",
                        measure, opt.value, opt.iteration, opt.parameters, mark
                    );
                }
            }
            RunResult::Analysis(analysis) => {
                println!("analysed: {}", analysis.target);
                for (statistic, value) in &analysis.statistics {
                    println!("  {}: {}", statistic, value);
                }
            }
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    let message = err.to_string();
    for code in [
        "setup_error",
        "invalid_transition",
        "unknown_plugin",
        "incompatible_dataset_format",
        "result_parse",
        "result_header_mismatch",
        "invalid_engine_config",
    ] {
        if message.starts_with(code) {
            return code;
        }
    }
    "command_failed"
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Resume { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Results { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .map_err(|_| std::io::Error::other("poisoned"))?
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn finish_run_logs_the_outcome() {
        let dir = std::env::temp_dir().join(format!(
            "clust_cli_outcome_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_micros())
                .unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).expect("scratch dir");
        let data = dir.join("iris.txt");
        std::fs::write(&data, "1\t0.1\n2\t0.2\n").expect("dataset");
        let yaml = format!(
            "name: outcome\nmode: clustering\nprograms:\n  - name: km\n    invocation: \"km -i %i% -o %o%\"\ndata:\n  - name: iris\n    dataset: \"{}\"\nmeasures:\n  - id: F1\n",
            data.display()
        );
        let config = EngineConfig {
            result_root: dir.join("results"),
            ..EngineConfig::default()
        };
        let ctx = Context::new(config).expect("context");
        let run = Run::new(ctx.clone(), clust_runner::RunDefinition::from_yaml(&yaml).expect("def"))
            .expect("run");

        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        let payload = tracing::subscriber::with_default(subscriber, || finish_run(&run, true))
            .expect("finish")
            .expect("json payload");
        ctx.shutdown();

        assert_eq!(payload["ok"], json!(true));
        let log = String::from_utf8(captured.0.lock().expect("lock").clone()).expect("utf8");
        assert!(log.contains("run outcome"), "{}", log);
        assert!(log.contains("inactive"), "{}", log);
    }
}
