use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

use crate::engine::{Record, Records};

/// Tipos de job que acepta el motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Ejecuta un script de transformación y guarda el resultado en cache
    Execute,
    /// Ejecuta un script y escribe la tabla resultante a disco
    WriteResults,
    /// Crea una tabla a partir de archivos de entrada
    CreateTable,
    /// Join aproximado entre dos datasets
    FuzzyJoin,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Execute,
        JobKind::WriteResults,
        JobKind::CreateTable,
        JobKind::FuzzyJoin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Execute => "execute",
            JobKind::WriteResults => "write_results",
            JobKind::CreateTable => "create_table",
            JobKind::FuzzyJoin => "fuzzy_join",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| PayloadError::UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("tipo de job desconocido: {0}")]
    UnknownKind(String),

    #[error("payload con forma inválida para {kind}: {reason}")]
    Shape { kind: JobKind, reason: String },

    #[error("payload inválido para {kind}: {reason}")]
    Invalid { kind: JobKind, reason: String },
}

/* --------- Pasos del script de transformación --------- */

/// Un paso del script. El script es una lista lineal de pasos que se
/// aplican sobre la colección de registros actual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Reemplaza la colección actual por filas inline
    Rows { rows: Records },
    ReadCsv { path: String },
    ReadJsonl { path: String },
    /// Deja sólo las filas donde `field == equals`
    Filter { field: String, equals: Value },
    Select { fields: Vec<String> },
    ReduceByKey { key: String, value: String },
    /// Inner join contra un archivo (CSV o JSONL según extensión)
    Join { path: String, key: String },
    Limit { n: usize },
    /// Espera `ms` milisegundos; se puede cancelar
    Sleep { ms: u64 },
    /// Falla el job con un error de aplicación
    Fail { message: String },
    /// Falla no controlada: el proceso termina de forma anormal
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Csv,
    Jsonl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableInputFormat {
    Csv,
    Jsonl,
    /// Se infiere por extensión de cada archivo
    #[default]
    Infer,
}

/// Origen de datos de un lado del fuzzy join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Rows(Vec<Record>),
    Csv(String),
    Jsonl(String),
}

/* --------- Payloads por tipo de job --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutePayload {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteResultsPayload {
    pub steps: Vec<Step>,
    /// Archivo de destino
    pub path: String,
    pub format: FileFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTablePayload {
    /// Patrón de archivos de entrada, ej: "/data/input/*.csv"
    pub input_glob: String,
    #[serde(default)]
    pub format: TableInputFormat,
}

fn default_threshold() -> f64 {
    0.8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FuzzyJoinPayload {
    pub left: DataSource,
    pub right: DataSource,
    pub left_on: String,
    pub right_on: String,
    /// Similitud mínima (0..=1) para considerar que dos claves coinciden
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

/// Job ya validado. En el wire viaja como `{"kind": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    Execute(ExecutePayload),
    WriteResults(WriteResultsPayload),
    CreateTable(CreateTablePayload),
    FuzzyJoin(FuzzyJoinPayload),
}

type PayloadParser = fn(Value) -> Result<JobPayload, serde_json::Error>;

fn parse_execute(v: Value) -> Result<JobPayload, serde_json::Error> {
    serde_json::from_value(v).map(JobPayload::Execute)
}

fn parse_write_results(v: Value) -> Result<JobPayload, serde_json::Error> {
    serde_json::from_value(v).map(JobPayload::WriteResults)
}

fn parse_create_table(v: Value) -> Result<JobPayload, serde_json::Error> {
    serde_json::from_value(v).map(JobPayload::CreateTable)
}

fn parse_fuzzy_join(v: Value) -> Result<JobPayload, serde_json::Error> {
    serde_json::from_value(v).map(JobPayload::FuzzyJoin)
}

/// Tabla de despacho: tipo de job -> parser de su payload.
const PARSERS: [(JobKind, PayloadParser); 4] = [
    (JobKind::Execute, parse_execute),
    (JobKind::WriteResults, parse_write_results),
    (JobKind::CreateTable, parse_create_table),
    (JobKind::FuzzyJoin, parse_fuzzy_join),
];

impl JobPayload {
    /// Interpreta un payload suelto según su tipo y lo valida.
    pub fn parse(kind: JobKind, payload: Value) -> Result<Self, PayloadError> {
        let parser = PARSERS
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, p)| *p)
            .ok_or_else(|| PayloadError::UnknownKind(kind.to_string()))?;

        let job = parser(payload).map_err(|e| PayloadError::Shape {
            kind,
            reason: e.to_string(),
        })?;

        job.validate()?;
        Ok(job)
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Execute(_) => JobKind::Execute,
            JobPayload::WriteResults(_) => JobKind::WriteResults,
            JobPayload::CreateTable(_) => JobKind::CreateTable,
            JobPayload::FuzzyJoin(_) => JobKind::FuzzyJoin,
        }
    }

    /// Chequeos que la forma del JSON no alcanza a expresar.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let kind = self.kind();
        let invalid = |reason: &str| PayloadError::Invalid {
            kind,
            reason: reason.to_string(),
        };

        match self {
            JobPayload::Execute(p) => {
                if p.steps.is_empty() {
                    return Err(invalid("el script no tiene pasos"));
                }
            }
            JobPayload::WriteResults(p) => {
                if p.steps.is_empty() {
                    return Err(invalid("el script no tiene pasos"));
                }
                if p.path.trim().is_empty() {
                    return Err(invalid("path de salida vacío"));
                }
            }
            JobPayload::CreateTable(p) => {
                if p.input_glob.trim().is_empty() {
                    return Err(invalid("input_glob vacío"));
                }
            }
            JobPayload::FuzzyJoin(p) => {
                if p.left_on.is_empty() || p.right_on.is_empty() {
                    return Err(invalid("left_on y right_on son obligatorios"));
                }
                if !(0.0..=1.0).contains(&p.threshold) {
                    return Err(invalid("threshold debe estar entre 0 y 1"));
                }
            }
        }

        Ok(())
    }
}
