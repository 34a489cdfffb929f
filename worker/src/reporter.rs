use common::WorkerMessage;
use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

/// Escribe los mensajes del protocolo, uno por línea. stdout queda
/// reservado para esto; los logs van a stderr.
pub struct Reporter<W: Write> {
    out: Arc<Mutex<W>>,
}

impl<W: Write> Clone for Reporter<W> {
    fn clone(&self) -> Self {
        Self {
            out: self.out.clone(),
        }
    }
}

impl Reporter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    pub fn send(&self, msg: &WorkerMessage) -> io::Result<()> {
        let line = msg.to_line()?;
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.write_all(line.as_bytes())?;
        out.flush()
    }

    pub fn progress(&self, fraction: f32, message: Option<String>) -> io::Result<()> {
        self.send(&WorkerMessage::Progress { fraction, message })
    }
}

#[cfg(test)]
impl Reporter<Vec<u8>> {
    /// Mensajes escritos hasta ahora.
    pub fn sent(&self) -> Vec<WorkerMessage> {
        let out = self.out.lock().unwrap();
        String::from_utf8_lossy(&out)
            .lines()
            .map(|l| WorkerMessage::from_line(l).unwrap())
            .collect()
    }
}
