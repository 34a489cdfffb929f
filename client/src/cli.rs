use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{engine, fuzzy, MemorySample, Table, TaskInfo};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;

/// - Local: default http://localhost:8080
/// - En otro host: MANAGER_URL=http://<host>:8080
fn manager_base_url() -> String {
    env::var("MANAGER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para enviar y consultar tareas del manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía una tarea: tipo de job + payload JSON
    Submit {
        /// execute | write_results | create_table | fuzzy_join
        #[arg(value_name = "TIPO")]
        kind: String,

        /// Payload JSON inline
        #[arg(long, conflicts_with = "file")]
        payload: Option<String>,

        /// Archivo con el payload JSON
        #[arg(long)]
        file: Option<String>,
    },
    /// Consulta el estado de una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Lista todas las tareas conocidas
    List,
    /// Descarga el resultado de una tarea completada
    Result {
        #[arg(value_name = "TASK_ID")]
        id: String,

        /// Guarda las filas en un JSONL en vez de imprimirlas
        #[arg(long)]
        output: Option<String>,
    },
    /// Muestras de memoria del worker de una tarea
    Memory {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    Cancel {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    Delete {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Confirma que el resultado ya se leyó y puede liberarse
    Ack {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },

    /// Demo: fuzzy join local entre dos CSV usando el engine
    FuzzyJoin {
        #[arg(value_name = "IZQ_CSV")]
        left: String,

        #[arg(value_name = "DER_CSV")]
        right: String,

        #[arg(long)]
        left_on: String,

        #[arg(long)]
        right_on: String,

        #[arg(long, default_value_t = 0.8)]
        threshold: f64,

        /// Ruta de salida JSONL
        #[arg(long, default_value = "fuzzy_join.jsonl")]
        output: String,
    },
}

#[derive(Deserialize)]
struct SubmitResponse {
    task_id: String,
}

/// Devuelve la respuesta si fue exitosa; si no, el error que mandó el manager.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body: Value = resp.json().await.unwrap_or(Value::Null);
    let msg = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("sin detalle");
    bail!("el manager respondió {}: {}", status, msg)
}

fn print_task(t: &TaskInfo) {
    println!("Tarea {}", t.id);
    println!("  tipo     : {}", t.kind);
    println!("  estado   : {}", t.status);
    println!("  progreso : {:.1}%", t.progress * 100.0);
    if let Some(ref m) = t.message {
        println!("  mensaje  : {}", m);
    }
    println!("  creada   : {}", t.created_at);
    if let Some(ref started) = t.started_at {
        println!("  iniciada : {}", started);
    }
    if let Some(ref ended) = t.ended_at {
        println!("  terminada: {}", ended);
    }
    if let Some(ref e) = t.error {
        println!("  error    : {}", e);
    }
    if let Some(ref r) = t.result_ref {
        println!("  resultado: {} filas, {} bytes", r.rows, r.bytes);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = manager_base_url();

    match cli.command {
        Commands::Submit {
            kind,
            payload,
            file,
        } => {
            let raw = match (payload, file) {
                (Some(p), _) => p,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("no se pudo leer {path}"))?,
                (None, None) => bail!("falta --payload o --file"),
            };
            let payload: Value = serde_json::from_str(&raw).context("payload JSON inválido")?;

            let url = format!("{}/api/v1/tasks", base_url);
            let resp = client
                .post(&url)
                .json(&json!({ "kind": kind, "payload": payload }))
                .send()
                .await?;
            let created: SubmitResponse = check(resp).await?.json().await?;
            println!("Tarea creada: {}", created.task_id);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/tasks/{}", base_url, id);
            let task: TaskInfo = check(client.get(&url).send().await?).await?.json().await?;
            print_task(&task);
        }

        Commands::List => {
            let url = format!("{}/api/v1/tasks", base_url);
            let tasks: Vec<TaskInfo> = check(client.get(&url).send().await?).await?.json().await?;
            if tasks.is_empty() {
                println!("No hay tareas.");
            }
            for t in tasks {
                println!(
                    "{}  {:<10} {:<13} {:>5.1}%",
                    t.id,
                    t.status.to_string(),
                    t.kind.to_string(),
                    t.progress * 100.0
                );
            }
        }

        Commands::Result { id, output } => {
            let url = format!("{}/api/v1/tasks/{id}/result", base_url);
            let table: Table = check(client.get(&url).send().await?).await?.json().await?;

            match output {
                Some(path) => {
                    table.write_jsonl(&path)?;
                    println!("{} filas guardadas en {}", table.len(), path);
                }
                None => {
                    println!("columnas: {}", table.columns.join(", "));
                    for row in &table.rows {
                        println!("{}", row);
                    }
                    println!("({} filas)", table.len());
                }
            }
        }

        Commands::Memory { id } => {
            let url = format!("{}/api/v1/tasks/{id}/memory", base_url);
            let samples: Vec<MemorySample> =
                check(client.get(&url).send().await?).await?.json().await?;
            if samples.is_empty() {
                println!("Sin muestras para {id}");
            }
            for s in samples {
                println!("{}  {:>10.1} MiB", s.at, s.bytes as f64 / (1024.0 * 1024.0));
            }
        }

        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/tasks/{id}/cancel", base_url);
            let ack: Value = check(client.post(&url).send().await?).await?.json().await?;
            println!("Tarea {id}: {}", ack["status"].as_str().unwrap_or("?"));
        }

        Commands::Delete { id } => {
            let url = format!("{}/api/v1/tasks/{id}", base_url);
            check(client.delete(&url).send().await?).await?;
            println!("Tarea {id} borrada");
        }

        Commands::Ack { id } => {
            let url = format!("{}/api/v1/tasks/{id}/ack", base_url);
            check(client.post(&url).send().await?).await?;
            println!("Resultado de {id} liberado");
        }

        Commands::FuzzyJoin {
            left,
            right,
            left_on,
            right_on,
            threshold,
            output,
        } => {
            println!("Ejecutando fuzzy join local entre CSVs:");
            println!("  left : {} ({})", left, left_on);
            println!("  right: {} ({})", right, right_on);
            println!("  umbral: {}", threshold);

            let l = engine::read_csv_to_records(&left)
                .with_context(|| format!("no se pudo leer {left}"))?;
            let r = engine::read_csv_to_records(&right)
                .with_context(|| format!("no se pudo leer {right}"))?;

            let joined = fuzzy::op_fuzzy_join(&l, &r, &left_on, &right_on, threshold);
            let table = Table::from_records(joined);
            table.write_jsonl(&output)?;

            println!("Join completado: {} filas en {}", table.len(), output);
        }
    }

    Ok(())
}
