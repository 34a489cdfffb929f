//! Join aproximado: dos filas coinciden si la similitud entre sus claves
//! supera un umbral, en lugar de exigir igualdad exacta.

use serde_json::{json, Value};

use crate::engine::{key_string, Record, Records};

/// Distancia de edición (inserción, borrado, sustitución) sobre chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Similitud normalizada en [0, 1]; 1 es igualdad tras normalizar
/// mayúsculas y espacios.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);

    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }

    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// Combina una fila de cada lado. Los campos repetidos del lado derecho
/// llevan prefijo `right_`, y se agrega la columna `similarity`.
fn merge_fuzzy(left: &Record, right: &Record, score: f64) -> Record {
    let mut obj = serde_json::Map::new();

    if let Some(lobj) = left.as_object() {
        for (k, v) in lobj {
            obj.insert(k.clone(), v.clone());
        }
    }
    if let Some(robj) = right.as_object() {
        for (k, v) in robj {
            if obj.contains_key(k) {
                obj.insert(format!("right_{k}"), v.clone());
            } else {
                obj.insert(k.clone(), v.clone());
            }
        }
    }

    // redondeo a 4 decimales para que la salida sea estable
    obj.insert("similarity".to_string(), json!((score * 10_000.0).round() / 10_000.0));
    Value::Object(obj)
}

/// Fuzzy join (inner): por cada par (izquierda, derecha) cuya similitud de
/// claves sea >= `threshold` se emite una fila combinada. Filas sin clave
/// escalar se descartan.
pub fn op_fuzzy_join(
    left: &[Record],
    right: &[Record],
    left_on: &str,
    right_on: &str,
    threshold: f64,
) -> Records {
    let right_keys: Vec<(String, &Record)> = right
        .iter()
        .filter_map(|r| r.get(right_on).and_then(key_string).map(|k| (k, r)))
        .collect();

    let mut out = Vec::new();

    for lrec in left {
        let Some(lkey) = lrec.get(left_on).and_then(key_string) else {
            continue;
        };

        for (rkey, rrec) in &right_keys {
            let score = similarity(&lkey, rkey);
            if score >= threshold {
                out.push(merge_fuzzy(lrec, rrec, score));
            }
        }
    }

    out
}
