//! Ejecución de un job dentro del proceso worker.
//!
//! Todo acá es bloqueante: `main` lo corre en `spawn_blocking` y le pasa un
//! flag de cancelación que se revisa entre pasos y dentro de los pasos
//! largos.

use common::{
    engine::{self, key_string},
    fuzzy, CreateTablePayload, DataSource, FileFormat, FuzzyJoinPayload, JobPayload, Record,
    Records, Step, Table, TableInputFormat, WriteResultsPayload,
};
use serde_json::{json, Value};
use std::{
    io::{self, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::reporter::Reporter;

/// Granularidad de los pasos `sleep` y de los bloques del fuzzy join.
const SLEEP_SLICE: Duration = Duration::from_millis(50);
const FUZZY_CHUNK_ROWS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("cancelado")]
    Canceled,

    #[error("error de E/S: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Application(String),
}

/// Lo que el job dejó escrito en el artefacto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutput {
    pub rows: usize,
    pub bytes: u64,
}

pub struct JobContext<W: Write> {
    cancel: Arc<AtomicBool>,
    reporter: Reporter<W>,
}

impl<W: Write> JobContext<W> {
    pub fn new(cancel: Arc<AtomicBool>, reporter: Reporter<W>) -> Self {
        Self { cancel, reporter }
    }

    fn check(&self) -> Result<(), JobError> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(JobError::Canceled)
        } else {
            Ok(())
        }
    }

    fn progress(&self, fraction: f32, message: String) {
        if let Err(e) = self.reporter.progress(fraction, Some(message)) {
            warn!("no se pudo reportar progreso: {}", e);
        }
    }
}

/// Ejecuta el job y escribe el artefacto (JSONL) en `artifact_path`.
pub fn run_job<W: Write>(
    job: &JobPayload,
    artifact_path: &str,
    ctx: &JobContext<W>,
) -> Result<JobOutput, JobError> {
    let table = match job {
        JobPayload::Execute(p) => Table::from_records(run_steps(&p.steps, ctx)?),
        JobPayload::WriteResults(p) => write_results(p, ctx)?,
        JobPayload::CreateTable(p) => create_table(p, ctx)?,
        JobPayload::FuzzyJoin(p) => fuzzy_join(p, ctx)?,
    };

    ctx.check()?;
    let bytes = table.write_jsonl(artifact_path)?;
    info!("artefacto escrito en {} ({} filas)", artifact_path, table.len());

    Ok(JobOutput {
        rows: table.len(),
        bytes,
    })
}

/* ---------------- execute ---------------- */

fn run_steps<W: Write>(steps: &[Step], ctx: &JobContext<W>) -> Result<Records, JobError> {
    let total = steps.len();
    let mut current: Records = Vec::new();

    for (i, step) in steps.iter().enumerate() {
        ctx.check()?;
        debug!("paso {}/{}: {:?}", i + 1, total, step);
        current = apply_step(step, current, ctx)?;

        // el 100% lo marca el gestor al completar
        let fraction = 0.95 * (i + 1) as f32 / total as f32;
        ctx.progress(fraction, format!("paso {}/{} ({} filas)", i + 1, total, current.len()));
    }

    Ok(current)
}

fn apply_step<W: Write>(
    step: &Step,
    current: Records,
    ctx: &JobContext<W>,
) -> Result<Records, JobError> {
    let out = match step {
        Step::Rows { rows } => rows.clone(),
        Step::ReadCsv { path } => engine::read_csv_to_records(path)?,
        Step::ReadJsonl { path } => engine::read_jsonl_to_records(path)?,
        Step::Filter { field, equals } => {
            engine::op_filter(current, |rec| rec.get(field).is_some_and(|v| same_value(v, equals)))
        }
        Step::Select { fields } => engine::op_select(current, fields),
        Step::ReduceByKey { key, value } => engine::op_reduce_by_key(current, key, value),
        Step::Join { path, key } => {
            let right = engine::read_records(path)?;
            engine::op_join_by_key(current, right, key)
        }
        Step::Limit { n } => {
            let mut current = current;
            current.truncate(*n);
            current
        }
        Step::Sleep { ms } => {
            sleep_cancellable(Duration::from_millis(*ms), ctx)?;
            current
        }
        Step::Fail { message } => return Err(JobError::Application(message.clone())),
        Step::Abort => {
            warn!("paso abort: terminando el proceso");
            std::process::abort();
        }
    };

    Ok(out)
}

/// Igualdad de filtro: los valores leídos de CSV llegan como texto, así
/// que "3" y 3 cuentan como iguales.
fn same_value(v: &Value, expected: &Value) -> bool {
    if v == expected {
        return true;
    }
    match (key_string(v), key_string(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn sleep_cancellable<W: Write>(total: Duration, ctx: &JobContext<W>) -> Result<(), JobError> {
    let deadline = Instant::now() + total;

    loop {
        ctx.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/* ---------------- write_results ---------------- */

fn write_results<W: Write>(
    p: &WriteResultsPayload,
    ctx: &JobContext<W>,
) -> Result<Table, JobError> {
    let table = Table::from_records(run_steps(&p.steps, ctx)?);
    ctx.check()?;

    let format = match p.format {
        FileFormat::Csv => {
            table.write_csv(&p.path)?;
            "csv"
        }
        FileFormat::Jsonl => {
            table.write_jsonl(&p.path)?;
            "jsonl"
        }
    };
    info!("resultados escritos en {} ({})", p.path, format);

    Ok(Table::from_records(vec![json!({
        "path": p.path,
        "format": format,
        "rows": table.len(),
    })]))
}

/* ---------------- create_table ---------------- */

fn create_table<W: Write>(p: &CreateTablePayload, ctx: &JobContext<W>) -> Result<Table, JobError> {
    let entries = glob::glob(&p.input_glob).map_err(|e| {
        JobError::Application(format!("patrón input_glob inválido {}: {}", p.input_glob, e))
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    if paths.is_empty() {
        info!("ningún archivo coincide con {}", p.input_glob);
    }

    let total = paths.len();
    let mut rows = Vec::new();

    for (i, path) in paths.iter().enumerate() {
        ctx.check()?;
        let path = path.to_string_lossy();

        let records = match p.format {
            TableInputFormat::Csv => engine::read_csv_to_records(&path)?,
            TableInputFormat::Jsonl => engine::read_jsonl_to_records(&path)?,
            TableInputFormat::Infer => engine::read_records(&path)?,
        };
        debug!("{}: {} filas", path, records.len());
        rows.extend(records);

        ctx.progress(
            0.95 * (i + 1) as f32 / total as f32,
            format!("archivo {}/{}", i + 1, total),
        );
    }

    Ok(Table::from_records(rows))
}

/* ---------------- fuzzy_join ---------------- */

fn load_source(source: &DataSource) -> Result<Records, JobError> {
    Ok(match source {
        DataSource::Rows(rows) => rows.clone(),
        DataSource::Csv(path) => engine::read_csv_to_records(path)?,
        DataSource::Jsonl(path) => engine::read_jsonl_to_records(path)?,
    })
}

fn fuzzy_join<W: Write>(p: &FuzzyJoinPayload, ctx: &JobContext<W>) -> Result<Table, JobError> {
    let left = load_source(&p.left)?;
    let right = load_source(&p.right)?;
    ctx.check()?;

    if !has_column(&left, &p.left_on) && !left.is_empty() {
        return Err(JobError::Application(format!(
            "la columna {} no existe en el lado izquierdo",
            p.left_on
        )));
    }
    if !has_column(&right, &p.right_on) && !right.is_empty() {
        return Err(JobError::Application(format!(
            "la columna {} no existe en el lado derecho",
            p.right_on
        )));
    }

    let total = left.len();
    let mut out = Vec::new();
    let mut done = 0;

    for chunk in left.chunks(FUZZY_CHUNK_ROWS) {
        ctx.check()?;
        out.extend(fuzzy::op_fuzzy_join(
            chunk,
            &right,
            &p.left_on,
            &p.right_on,
            p.threshold,
        ));
        done += chunk.len();
        ctx.progress(
            0.95 * done as f32 / total as f32,
            format!("{}/{} filas comparadas", done, total),
        );
    }

    Ok(Table::from_records(out))
}

fn has_column(rows: &[Record], column: &str) -> bool {
    rows.iter().any(|r| r.get(column).is_some())
}
