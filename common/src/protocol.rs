//! Mensajes entre el supervisor y el proceso worker.
//!
//! El supervisor escribe una única `WorkerAssignment` (JSON) en el stdin del
//! worker y lo cierra. El worker responde con `WorkerMessage` en stdout, un
//! JSON por línea. No hay otro canal de vuelta.

use serde::{Deserialize, Serialize};

use crate::job::JobPayload;
use crate::task::TaskId;

/// Código de salida cuando el job falla con error de aplicación.
pub const EXIT_FAILED: i32 = 1;
/// Código de salida tras atender un pedido de terminación cooperativa.
pub const EXIT_CANCELED: i32 = 3;

/// Variables de entorno que el launcher exporta al worker.
pub const ENV_TASK_ID: &str = "FLOW_TASK_ID";
pub const ENV_ARTIFACT_PATH: &str = "FLOW_ARTIFACT_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub task_id: TaskId,
    /// Dónde debe dejar el worker el artefacto (JSONL)
    pub artifact_path: String,
    pub job: JobPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Started,
    Progress {
        fraction: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Completed {
        artifact_path: String,
        rows: usize,
        bytes: u64,
    },
    Failed {
        error: String,
    },
}

impl WorkerMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerMessage::Completed { .. } | WorkerMessage::Failed { .. }
        )
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mensajes_usan_tag_type() {
        let line = WorkerMessage::Progress {
            fraction: 0.5,
            message: None,
        }
        .to_line()
        .unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.trim(), r#"{"type":"progress","fraction":0.5}"#);
    }

    #[test]
    fn from_line_acepta_lo_que_escribe_un_script() {
        let msg = WorkerMessage::from_line(
            "  {\"type\":\"completed\",\"artifact_path\":\"/tmp/a.jsonl\",\"rows\":2,\"bytes\":30}\n",
        )
        .unwrap();

        assert!(msg.is_terminal());
        assert_eq!(
            msg,
            WorkerMessage::Completed {
                artifact_path: "/tmp/a.jsonl".into(),
                rows: 2,
                bytes: 30,
            }
        );
    }

    #[test]
    fn from_line_rechaza_basura() {
        assert!(WorkerMessage::from_line("hola").is_err());
        assert!(WorkerMessage::from_line(r#"{"type":"otro"}"#).is_err());
    }
}
