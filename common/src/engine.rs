use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::Path,
};

/// Tipo genérico de registro (fila de datos).
/// Usamos JSON para poder representar CSV, JSONL o filas inline.
pub type Record = Value;

/// Colección en memoria de registros.
pub type Records = Vec<Record>;

/// Tabla resultante de un job: columnas + filas.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Records,
}

impl Table {
    /// Arma la tabla deduciendo las columnas en orden de aparición.
    pub fn from_records(rows: Records) -> Self {
        let mut seen = HashSet::new();
        let mut columns = Vec::new();

        for rec in &rows {
            if let Some(obj) = rec.as_object() {
                for k in obj.keys() {
                    if seen.insert(k.clone()) {
                        columns.push(k.clone());
                    }
                }
            }
        }

        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Escribe las filas como JSONL y devuelve los bytes escritos.
    pub fn write_jsonl(&self, path: &str) -> io::Result<u64> {
        let mut writer = create_output(path)?;
        let mut bytes = 0u64;

        for rec in &self.rows {
            let line = serde_json::to_string(rec)?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            bytes += line.len() as u64 + 1;
        }

        writer.flush()?;
        Ok(bytes)
    }

    pub fn read_jsonl(path: &str) -> io::Result<Self> {
        Ok(Self::from_records(read_jsonl_to_records(path)?))
    }

    /// Escribe la tabla como CSV con encabezado. Valores no escalares
    /// se guardan como JSON.
    pub fn write_csv(&self, path: &str) -> io::Result<()> {
        let writer = create_output(path)?;
        let mut wtr = csv::Writer::from_writer(writer);

        wtr.write_record(&self.columns)?;
        for rec in &self.rows {
            let row: Vec<String> = self
                .columns
                .iter()
                .map(|c| match rec.get(c) {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                })
                .collect();
            wtr.write_record(&row)?;
        }

        wtr.flush()?;
        Ok(())
    }
}

/// Crea el archivo de salida (y su carpeta si hace falta).
fn create_output(path: &str) -> io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Representación textual de una clave. Sólo escalares sirven como clave.
pub fn key_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Valor numérico de un campo; acepta números y strings numéricos (CSV).
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

/* =========================
   Operadores genéricos
   ========================= */

/// map: aplica una función a cada registro y devuelve una nueva colección.
pub fn op_map<F>(input: Records, f: F) -> Records
where
    F: Fn(&Record) -> Record,
{
    input.into_iter().map(|rec| f(&rec)).collect()
}

/// filter: deja pasar sólo los registros que cumplan el predicado.
pub fn op_filter<F>(input: Records, f: F) -> Records
where
    F: Fn(&Record) -> bool,
{
    input.into_iter().filter(|rec| f(rec)).collect()
}

/// select: proyecta cada registro a los campos pedidos, en ese orden.
pub fn op_select(input: Records, fields: &[String]) -> Records {
    op_map(input, |rec| {
        let mut obj = serde_json::Map::new();
        for f in fields {
            obj.insert(f.clone(), rec.get(f).cloned().unwrap_or(Value::Null));
        }
        Value::Object(obj)
    })
}

/// reduce_by_key:
///   - Agrupa por el campo `key_field`.
///   - Suma el campo numérico `value_field`.
///   - Devuelve registros `{ key_field: <clave>, value_field: <suma> }` ordenados por clave.
pub fn op_reduce_by_key(input: Records, key_field: &str, value_field: &str) -> Records {
    let mut acc: HashMap<String, f64> = HashMap::new();

    for rec in input.into_iter() {
        let key_opt = rec.get(key_field).and_then(key_string);
        let val_opt = rec.get(value_field).and_then(as_number);

        if let (Some(key), Some(val)) = (key_opt, val_opt) {
            *acc.entry(key).or_insert(0.0) += val;
        }
    }

    // determinista: ordenar por clave
    let mut entries: Vec<(String, f64)> = acc.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    entries
        .into_iter()
        .map(|(k, v)| {
            json!({
                key_field: k,
                value_field: number_to_value(v),
            })
        })
        .collect()
}

/* =========================
   JOIN en memoria
   ========================= */

/// Fusiona dos registros JSON en uno solo.
/// - el campo `key_field` del lado derecho no se repite
/// - si un campo existe en ambos lados, se respeta el del lado izquierdo
///   y el del derecho se guarda con prefijo `right_`.
pub fn merge_records(left: &Record, right: &Record, key_field: &str) -> Record {
    let mut obj = serde_json::Map::new();

    if let Some(lobj) = left.as_object() {
        for (k, v) in lobj {
            obj.insert(k.clone(), v.clone());
        }
    }

    if let Some(robj) = right.as_object() {
        for (k, v) in robj {
            if k == key_field {
                continue;
            }
            if obj.contains_key(k) {
                obj.insert(format!("right_{}", k), v.clone());
            } else {
                obj.insert(k.clone(), v.clone());
            }
        }
    }

    Value::Object(obj)
}

/// Inner join en memoria entre dos colecciones por el campo `key_field`.
/// Si hay N registros a la izquierda y M a la derecha con la misma clave,
/// se generan N*M registros combinados.
pub fn op_join_by_key(left: Records, right: Records, key_field: &str) -> Records {
    // indexamos el lado derecho por clave
    let mut index: HashMap<String, Vec<Record>> = HashMap::new();

    for rec in right.into_iter() {
        if let Some(k) = rec.get(key_field).and_then(key_string) {
            index.entry(k).or_default().push(rec);
        }
    }

    let mut out = Vec::new();

    for lrec in left.into_iter() {
        let Some(key) = lrec.get(key_field).and_then(key_string) else {
            continue;
        };

        if let Some(r_matches) = index.get(&key) {
            for rrec in r_matches {
                out.push(merge_records(&lrec, rrec, key_field));
            }
        }
    }

    out
}

/* =========================
   Lectura de archivos a Records
   ========================= */

/// Lee un CSV con encabezado; cada valor queda como string.
pub fn read_csv_to_records(path: &str) -> io::Result<Records> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    // Limpia BOM por si viene de Excel/Windows
    let headers: Vec<String> = rdr
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut out = Vec::new();
    for row in rdr.records() {
        let row = row?;
        if row.iter().all(|c| c.is_empty()) {
            continue;
        }

        let mut obj = serde_json::Map::new();
        for (idx, h) in headers.iter().enumerate() {
            let val = row.get(idx).unwrap_or("");
            obj.insert(h.clone(), json!(val));
        }
        out.push(Value::Object(obj));
    }

    Ok(out)
}

pub fn read_jsonl_to_records(path: &str) -> io::Result<Records> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();

    for line_res in reader.lines() {
        let line = line_res?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: Value = serde_json::from_str(&line)?;
        out.push(rec);
    }

    Ok(out)
}

/// Lee CSV o JSONL según la extensión del archivo.
pub fn read_records(path: &str) -> io::Result<Records> {
    let ext = Path::new(path)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "csv" => read_csv_to_records(path),
        "json" | "jsonl" | "ndjson" => read_jsonl_to_records(path),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no sé leer archivos con extensión '{ext}': {path}"),
        )),
    }
}
