//! Built-in job handlers.
//!
//! Lightweight, deterministic stand-ins for the model-backed operations the
//! compute node runs. They keep the same call shapes (text in, vectors or
//! labels out) so producers and the dispatch path can be exercised without
//! an accelerator.

use serde_json::{json, Value};

use crate::error::HandlerError;
use crate::queue::JobInput;

/// Width of `sentence-encode` vectors.
pub const EMBEDDING_DIM: usize = 64;

const KMEANS_ITERATIONS: usize = 25;

const POSITIVE: &[&str] = &[
    "good", "great", "happy", "love", "excellent", "calm", "grateful", "joy", "glad", "nice",
    "wonderful", "better", "hope", "proud", "relaxed",
];
const NEGATIVE: &[&str] = &[
    "bad", "sad", "angry", "hate", "terrible", "anxious", "tired", "awful", "worse", "stress",
    "stressed", "afraid", "lonely", "upset", "worried",
];

/// `sentence-encode(text | [text])` -> vector | [vector]
pub fn sentence_encode(input: &JobInput) -> Result<Value, HandlerError> {
    match required(input, 0)? {
        Value::String(text) => Ok(json!(encode(text))),
        Value::Array(_) => {
            let texts = string_list(input, 0)?;
            Ok(json!(texts.iter().map(|t| encode(t)).collect::<Vec<_>>()))
        }
        _ => Err(invalid("argument 0 must be a string or a list of strings")),
    }
}

/// `cosine(vector, vector | [vector])` -> similarity | [similarity]
pub fn cosine(input: &JobInput) -> Result<Value, HandlerError> {
    let a = vector(required(input, 0)?, "argument 0")?;
    match required(input, 1)? {
        Value::Array(items) if items.first().is_some_and(Value::is_array) => {
            let rows = matrix(required(input, 1)?, "argument 1")?;
            let sims = rows
                .iter()
                .map(|row| similarity(&a, row))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(json!(sims))
        }
        other => {
            let b = vector(other, "argument 1")?;
            Ok(json!(similarity(&a, &b)?))
        }
    }
}

/// `summarization(text | [text], max_length=60)` -> summary | [summary]
///
/// Extractive: leading sentences up to `max_length` words.
pub fn summarization(input: &JobInput) -> Result<Value, HandlerError> {
    let max_words = usize_kwarg(input, "max_length")?.unwrap_or(60).max(1);
    match required(input, 0)? {
        Value::String(text) => Ok(json!(summarize(text, max_words))),
        Value::Array(_) => {
            let texts = string_list(input, 0)?;
            Ok(json!(texts
                .iter()
                .map(|t| summarize(t, max_words))
                .collect::<Vec<_>>()))
        }
        _ => Err(invalid("argument 0 must be a string or a list of strings")),
    }
}

/// `cluster([vector], n_clusters=2)` -> [label]
pub fn cluster(input: &JobInput) -> Result<Value, HandlerError> {
    let points = matrix(required(input, 0)?, "argument 0")?;
    if points.is_empty() {
        return Ok(json!([]));
    }
    let dim = points[0].len();
    if points.iter().any(|p| p.len() != dim) {
        return Err(invalid("all vectors must have the same length"));
    }
    let k = usize_kwarg(input, "n_clusters")?
        .unwrap_or(2)
        .clamp(1, points.len());
    Ok(json!(kmeans(&points, k)))
}

/// `sentiment-analysis(text | [text])` -> {label, score} | [{label, score}]
pub fn sentiment_analysis(input: &JobInput) -> Result<Value, HandlerError> {
    match required(input, 0)? {
        Value::String(text) => Ok(sentiment(text)),
        Value::Array(_) => {
            let texts = string_list(input, 0)?;
            Ok(Value::Array(texts.iter().map(|t| sentiment(t)).collect()))
        }
        _ => Err(invalid("argument 0 must be a string or a list of strings")),
    }
}

fn invalid(msg: &str) -> HandlerError {
    HandlerError::InvalidArguments(msg.to_string())
}

fn required(input: &JobInput, index: usize) -> Result<&Value, HandlerError> {
    input
        .arg(index)
        .ok_or_else(|| HandlerError::InvalidArguments(format!("missing argument {}", index)))
}

fn string_list(input: &JobInput, index: usize) -> Result<Vec<String>, HandlerError> {
    match required(input, index)? {
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid("list items must be strings"))
            })
            .collect(),
        _ => Err(invalid("expected a list of strings")),
    }
}

fn usize_kwarg(input: &JobInput, key: &str) -> Result<Option<usize>, HandlerError> {
    match input.kwarg(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| HandlerError::InvalidArguments(format!("{} must be a non-negative integer", key))),
    }
}

fn vector(value: &Value, what: &str) -> Result<Vec<f64>, HandlerError> {
    let items = value
        .as_array()
        .ok_or_else(|| HandlerError::InvalidArguments(format!("{} must be a list of numbers", what)))?;
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| HandlerError::InvalidArguments(format!("{} must be a list of numbers", what)))
        })
        .collect()
}

fn matrix(value: &Value, what: &str) -> Result<Vec<Vec<f64>>, HandlerError> {
    let rows = value
        .as_array()
        .ok_or_else(|| HandlerError::InvalidArguments(format!("{} must be a list of vectors", what)))?;
    rows.iter().map(|row| vector(row, what)).collect()
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// FNV-1a, stable across builds and platforms.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn encode(text: &str) -> Vec<f64> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    for token in tokens(text) {
        let h = fnv1a(token.as_bytes());
        let bucket = (h % EMBEDDING_DIM as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign;
    }
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

fn similarity(a: &[f64], b: &[f64]) -> Result<f64, HandlerError> {
    if a.len() != b.len() {
        return Err(HandlerError::InvalidArguments(format!(
            "vector lengths differ ({} vs {})",
            a.len(),
            b.len()
        )));
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (na * nb))
}

fn summarize(text: &str, max_words: usize) -> String {
    let mut out = String::new();
    let mut words = 0;
    for sentence in text
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let n = sentence.split_whitespace().count();
        if words > 0 && words + n > max_words {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        if n > max_words {
            // first sentence alone is over budget
            out.push_str(
                &sentence
                    .split_whitespace()
                    .take(max_words)
                    .collect::<Vec<_>>()
                    .join(" "),
            );
            break;
        }
        out.push_str(sentence);
        words += n;
    }
    out
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Lloyd's algorithm with farthest-point seeding from the first point.
fn kmeans(points: &[Vec<f64>], k: usize) -> Vec<usize> {
    let mut centroids = vec![points[0].clone()];
    while centroids.len() < k {
        let next = points
            .iter()
            .max_by(|a, b| {
                let da = nearest(&centroids, a).1;
                let db = nearest(&centroids, b).1;
                da.total_cmp(&db)
            })
            .cloned()
            .unwrap_or_else(|| points[0].clone());
        centroids.push(next);
    }

    let mut labels = vec![0; points.len()];
    for _ in 0..KMEANS_ITERATIONS {
        let assigned: Vec<usize> = points.iter().map(|p| nearest(&centroids, p).0).collect();
        let converged = assigned == labels;
        labels = assigned;

        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f64>> = points
                .iter()
                .zip(&labels)
                .filter(|(_, l)| **l == c)
                .map(|(p, _)| p)
                .collect();
            if members.is_empty() {
                continue;
            }
            for (d, value) in centroid.iter_mut().enumerate() {
                *value = members.iter().map(|m| m[d]).sum::<f64>() / members.len() as f64;
            }
        }
        if converged {
            break;
        }
    }
    labels
}

fn nearest(centroids: &[Vec<f64>], point: &[f64]) -> (usize, f64) {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(c, point)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((0, 0.0))
}

fn sentiment(text: &str) -> Value {
    let (mut pos, mut neg) = (0i64, 0i64);
    for token in tokens(text) {
        if POSITIVE.contains(&token.as_str()) {
            pos += 1;
        } else if NEGATIVE.contains(&token.as_str()) {
            neg += 1;
        }
    }
    let hits = pos + neg;
    let (label, score) = match pos.cmp(&neg) {
        std::cmp::Ordering::Greater => ("POSITIVE", pos as f64 / hits as f64),
        std::cmp::Ordering::Less => ("NEGATIVE", neg as f64 / hits as f64),
        std::cmp::Ordering::Equal => ("NEUTRAL", 0.5),
    };
    json!({ "label": label, "score": score })
}
