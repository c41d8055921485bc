use anyhow::Result;
use clap::{Parser, Subcommand};
use common::{
    run_exit_code, ErrorResponse, FailureKind, HistoryEntry, Interval, PipelineConfig, RunRecord,
    RunResults, RunStatusResponse, TaskRecord, Trigger, TriggerRequest, EXIT_STILL_RUNNING,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::{env, time::Duration};
use tracing::debug;

/// - En Docker: SCHEDULER_URL=http://scheduler:8080
/// - Local: default http://localhost:8080
fn scheduler_base_url() -> String {
    env::var("SCHEDULER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "CLI para operar el pipeline ETL a través del scheduler")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dispara un run manual para un intervalo (YYYY-MM-DD)
    Trigger {
        #[arg(value_name = "INTERVALO")]
        interval: Interval,
        /// Reejecuta también las tareas que ya terminaron bien
        #[arg(long)]
        force: bool,
        /// Espera a que el run termine y sale con su código
        #[arg(long)]
        wait: bool,
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Estado del run y de sus tareas
    Status {
        #[arg(value_name = "INTERVALO")]
        interval: Interval,
    },
    /// Tareas del run en orden topológico
    Tasks {
        #[arg(value_name = "INTERVALO")]
        interval: Interval,
    },
    /// Historial de transiciones
    History {
        #[arg(value_name = "INTERVALO")]
        interval: Interval,
    },
    /// Reintenta una tarea fallida y lo que quedó aguas abajo
    Retry {
        #[arg(value_name = "INTERVALO")]
        interval: Interval,
        #[arg(value_name = "TAREA")]
        task: String,
        #[arg(long)]
        wait: bool,
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Cancela el run en curso
    Cancel {
        #[arg(value_name = "INTERVALO")]
        interval: Interval,
    },
    /// Lista todos los runs
    Runs,
    /// Particiones visibles de un intervalo
    Results {
        #[arg(value_name = "INTERVALO")]
        interval: Interval,
    },
    /// Ejecuta un intervalo en este proceso, sin scheduler
    RunLocal {
        #[arg(value_name = "INTERVALO")]
        interval: Interval,
        /// Ruta del TOML; por defecto ETL_CONFIG o pipeline.toml
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        force: bool,
    },
}

/* ---------------- salida ---------------- */

fn print_run(run: &RunRecord) {
    println!("Run {} / {}:", run.pipeline_id, run.interval);
    println!("  estado: {:?}", run.status);
    println!("  trigger: {:?}", run.trigger);
    println!("  iniciado: {}", run.started_at);
    if let Some(ref done) = run.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(ref task) = run.failed_task {
        println!("  tarea fallida: {}", task);
    }
    if let Some(ref err) = run.last_error {
        println!("  error: {}", err);
    }
    if let Some(kind) = run.failure_kind {
        println!("  tipo de fallo: {:?} (exit {})", kind, kind.exit_code());
    }
}

fn print_tasks(tasks: &[TaskRecord]) {
    if tasks.is_empty() {
        println!("  (sin tareas)");
        return;
    }
    for t in tasks {
        println!("  - {:<12} {:<16} intento={}", t.task_id, t.state, t.attempt);
        if let Some(ref err) = t.last_error {
            println!("      error: {}", err);
        }
        for (name, value) in &t.metrics {
            println!("      {}: {}", name, value);
        }
    }
}

fn print_history(history: &[HistoryEntry]) {
    for h in history {
        let from = h
            .from
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        print!("  {} {:<12} {} -> {} (intento {})", h.at, h.task_id, from, h.to, h.attempt);
        match h.error {
            Some(ref e) => println!(": {}", e),
            None => println!(),
        }
    }
}

/* ---------------- HTTP ---------------- */

/// Decodifica una respuesta exitosa; si no, imprime el error del scheduler.
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<Option<T>> {
    let status = resp.status();
    if status.is_success() {
        return Ok(Some(resp.json().await?));
    }

    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(err) => eprintln!("Error ({}): {}", status, err.error),
        Err(_) => eprintln!("Error ({}): {}", status, text),
    }
    Ok(None)
}

async fn fetch_status(
    client: &Client,
    base_url: &str,
    interval: &Interval,
) -> Result<Option<RunStatusResponse>> {
    let url = format!("{}/api/v1/runs/{}", base_url, interval);
    decode(client.get(&url).send().await?).await
}

/// Consulta el run hasta que termina o se agota el tiempo.
async fn wait_for(
    client: &Client,
    base_url: &str,
    interval: &Interval,
    timeout: Duration,
) -> Result<i32> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let Some(status) = fetch_status(client, base_url, interval).await? else {
            return Ok(FailureKind::Other.exit_code());
        };
        if status.run.status.is_terminal() {
            print_run(&status.run);
            print_tasks(&status.tasks);
            return Ok(status.exit_code());
        }
        if tokio::time::Instant::now() >= deadline {
            eprintln!("El run de {} sigue en curso; se deja de esperar", interval);
            return Ok(EXIT_STILL_RUNNING);
        }
        debug!("run {} todavía en curso", interval);
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/* ---------------- comandos ---------------- */

/// Ejecuta el comando y devuelve el código de salida del proceso.
pub async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = scheduler_base_url();

    let code = match cli.command {
        Commands::Trigger {
            interval,
            force,
            wait,
            timeout_secs,
        } => {
            let url = format!("{}/api/v1/runs", base_url);
            let resp = client
                .post(&url)
                .json(&TriggerRequest { interval, force })
                .send()
                .await?;
            let Some(accepted) = decode::<RunStatusResponse>(resp).await? else {
                return Ok(FailureKind::Other.exit_code());
            };
            println!("Run disparado para {} (force={})", accepted.run.interval, force);

            if wait {
                wait_for(&client, &base_url, &interval, Duration::from_secs(timeout_secs)).await?
            } else {
                0
            }
        }

        Commands::Status { interval } => match fetch_status(&client, &base_url, &interval).await? {
            Some(status) => {
                print_run(&status.run);
                println!("  tareas:");
                print_tasks(&status.tasks);
                status.exit_code()
            }
            None => FailureKind::Other.exit_code(),
        },

        Commands::Tasks { interval } => {
            let url = format!("{}/api/v1/runs/{}/tasks", base_url, interval);
            match decode::<Vec<TaskRecord>>(client.get(&url).send().await?).await? {
                Some(tasks) => {
                    println!("Tareas de {}:", interval);
                    print_tasks(&tasks);
                    0
                }
                None => FailureKind::Other.exit_code(),
            }
        }

        Commands::History { interval } => {
            let url = format!("{}/api/v1/runs/{}/history", base_url, interval);
            match decode::<Vec<HistoryEntry>>(client.get(&url).send().await?).await? {
                Some(history) => {
                    println!("Historial de {}:", interval);
                    print_history(&history);
                    0
                }
                None => FailureKind::Other.exit_code(),
            }
        }

        Commands::Retry {
            interval,
            task,
            wait,
            timeout_secs,
        } => {
            let url = format!("{}/api/v1/runs/{}/tasks/{}/retry", base_url, interval, task);
            let resp = client.post(&url).send().await?;
            if decode::<RunStatusResponse>(resp).await?.is_none() {
                return Ok(FailureKind::Other.exit_code());
            }
            println!("Reintento de {} disparado para {}", task, interval);

            if wait {
                wait_for(&client, &base_url, &interval, Duration::from_secs(timeout_secs)).await?
            } else {
                0
            }
        }

        Commands::Cancel { interval } => {
            let url = format!("{}/api/v1/runs/{}/cancel", base_url, interval);
            match decode::<RunStatusResponse>(client.post(&url).send().await?).await? {
                Some(_) => {
                    println!("Cancelación solicitada para {}", interval);
                    0
                }
                None => FailureKind::Other.exit_code(),
            }
        }

        Commands::Runs => {
            let url = format!("{}/api/v1/runs", base_url);
            match decode::<Vec<RunRecord>>(client.get(&url).send().await?).await? {
                Some(runs) if runs.is_empty() => {
                    println!("No hay runs registrados.");
                    0
                }
                Some(runs) => {
                    for r in runs {
                        let kind = r
                            .failure_kind
                            .map(|k| format!(" ({:?})", k))
                            .unwrap_or_default();
                        println!("  {}  {:?}{}  [{:?}]", r.interval, r.status, kind, r.trigger);
                    }
                    0
                }
                None => FailureKind::Other.exit_code(),
            }
        }

        Commands::Results { interval } => {
            let url = format!("{}/api/v1/runs/{}/results", base_url, interval);
            match decode::<RunResults>(client.get(&url).send().await?).await? {
                Some(results) => {
                    println!("Resultados de {} / {}:", results.pipeline_id, results.interval);
                    println!("  raíz de salida: {}", results.root);
                    if results.files.is_empty() {
                        println!("  (sin particiones visibles)");
                    } else {
                        println!("  archivos:");
                        for f in results.files {
                            println!("    - {}", f);
                        }
                    }
                    0
                }
                None => FailureKind::Other.exit_code(),
            }
        }

        Commands::RunLocal {
            interval,
            config,
            force,
        } => run_local(interval, config.as_deref(), force).await,
    };

    Ok(code)
}

async fn run_local(interval: Interval, config: Option<&str>, force: bool) -> i32 {
    let cfg = match config {
        Some(path) => PipelineConfig::load(path),
        None => PipelineConfig::load_default(),
    };
    let runner = match cfg.and_then(|c| c.build_runner()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Configuración inválida: {}", e);
            return FailureKind::GraphError.exit_code();
        }
    };

    println!("Ejecutando {} localmente para {}", runner.pipeline_id(), interval);
    let run = match runner.run(interval, Trigger::Manual, force).await {
        Ok(run) => run,
        Err(e) => {
            eprintln!("Error ejecutando el run: {}", e);
            return FailureKind::Other.exit_code();
        }
    };

    print_run(&run);
    if let Ok(tasks) = runner.tasks(&interval) {
        print_tasks(&tasks);
    }
    run_exit_code(&run)
}
